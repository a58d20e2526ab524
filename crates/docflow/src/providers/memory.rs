//! Process-local provider implementations
//!
//! Same semantics as the SQLite providers without durability; used by the
//! `memory` backend and throughout the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::types::{DocumentRecord, EntryId, PatchOutcome, RecordPatch, StreamEntry};

use super::broker::{wait_for_entries, BlockMode, StreamBroker};
use super::record_store::RecordStore;

// ==================== Record Store ====================

/// In-memory record store backed by concurrent maps
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<Uuid, DocumentRecord>,
    payloads: DashMap<Uuid, Vec<u8>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: &DocumentRecord, payload: &[u8]) -> Result<()> {
        if self.records.contains_key(&record.id) {
            return Err(Error::storage(format!("Document {} already exists", record.id)));
        }
        self.payloads.insert(record.id, payload.to_vec());
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<PatchOutcome> {
        // The entry guard holds the shard lock for the whole read-modify-write
        match self.records.get_mut(&id) {
            Some(mut record) => patch.apply_to(&mut record),
            None => Ok(PatchOutcome::Missing),
        }
    }

    async fn get_payload(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self.payloads.get(&id).map(|p| p.clone()))
    }

    async fn delete_payload(&self, id: Uuid) -> Result<bool> {
        let removed = self.payloads.remove(&id).is_some();
        if let Some(mut record) = self.records.get_mut(&id) {
            if record.content_ref.take().is_some() {
                record.updated_at = chrono::Utc::now();
            }
        }
        Ok(removed)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.payloads.remove(&id);
        Ok(self.records.remove(&id).is_some())
    }

    fn payload_ref(&self, id: Uuid) -> String {
        format!("memory://payloads/{}", id)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ==================== Stream Broker ====================

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct TopicState {
    /// Sorted by id
    entries: Vec<(EntryId, String)>,
    groups: HashMap<String, GroupState>,
}

impl TopicState {
    fn tail(&self) -> u64 {
        self.entries.last().map(|(id, _)| id.0).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    topics: HashMap<String, TopicState>,
}

/// In-memory broker with consumer groups and idle reclaim
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    poll_interval: Duration,
    reclaim_idle: Duration,
}

impl MemoryBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            poll_interval: config.poll_interval(),
            reclaim_idle: config.reclaim_idle(),
        }
    }

    fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock();
        let group_missing = || Error::GroupNotFound {
            topic: topic.to_string(),
            group: group.to_string(),
        };

        let topic_state = state.topics.get_mut(topic).ok_or_else(group_missing)?;
        let TopicState { entries, groups } = topic_state;
        let group_state = groups.get_mut(group).ok_or_else(group_missing)?;

        let now = Instant::now();
        let mut batch = Vec::new();

        for (id, pending) in group_state.pending.iter_mut() {
            if batch.len() >= max_count {
                break;
            }
            if now.duration_since(pending.delivered_at) < self.reclaim_idle {
                continue;
            }
            let Ok(idx) = entries.binary_search_by_key(id, |(entry_id, _)| *entry_id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            batch.push(StreamEntry {
                id: *id,
                body: entries[idx].1.clone(),
                delivery_count: pending.delivery_count,
            });
        }

        let start = entries.partition_point(|(id, _)| id.0 <= group_state.last_delivered);
        let remaining = max_count.saturating_sub(batch.len());
        for (id, body) in entries[start..].iter().take(remaining) {
            group_state.pending.insert(
                *id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            group_state.last_delivered = id.0;
            batch.push(StreamEntry {
                id: *id,
                body: body.clone(),
                delivery_count: 1,
            });
        }

        Ok(batch)
    }

    /// Consumer currently holding an unacknowledged entry
    pub fn pending_owner(&self, topic: &str, group: &str, id: EntryId) -> Option<String> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)?
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.consumer.clone())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let topic_state = state.topics.entry(topic.to_string()).or_default();
        if topic_state.groups.contains_key(group) {
            return Ok(false);
        }
        let tail = topic_state.tail();
        topic_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered: tail,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_next(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: BlockMode,
    ) -> Result<Vec<StreamEntry>> {
        wait_for_entries(&self.notify, self.poll_interval, block, || async {
            self.claim(topic, group, consumer, max_count)
        })
        .await
    }

    async fn append(&self, topic: &str, body: String) -> Result<EntryId> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = EntryId(state.next_id);
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .entries
                .push((id, body));
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false);
        Ok(removed)
    }

    async fn entries(
        &self,
        topic: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>> {
        let state = self.state.lock();
        let Some(topic_state) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };
        let after = after.map(|id| id.0).unwrap_or(0);
        let start = topic_state.entries.partition_point(|(id, _)| id.0 <= after);
        Ok(topic_state.entries[start..]
            .iter()
            .take(limit)
            .map(|(id, body)| StreamEntry {
                id: *id,
                body: body.clone(),
                delivery_count: 0,
            })
            .collect())
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
        let state = self.state.lock();
        Ok(state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentStatus;
    use std::sync::Arc;

    fn broker(reclaim_idle_ms: u64) -> MemoryBroker {
        MemoryBroker::new(&BrokerConfig {
            poll_interval_ms: 20,
            reclaim_idle_ms,
        })
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let broker = broker(60_000);
        assert!(broker.ensure_group("t", "g").await.unwrap());
        assert!(!broker.ensure_group("t", "g").await.unwrap());
    }

    #[tokio::test]
    async fn test_group_positioned_at_tail() {
        let broker = broker(60_000);
        broker.append("t", "old".into()).await.unwrap();
        broker.ensure_group("t", "g").await.unwrap();
        broker.append("t", "new".into()).await.unwrap();

        let batch = broker.read_next("t", "g", "c", 10, BlockMode::Immediate).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "new");
    }

    #[tokio::test]
    async fn test_delivers_in_append_order_once_per_group() {
        let broker = broker(60_000);
        broker.ensure_group("t", "g").await.unwrap();
        broker.ensure_group("t", "other").await.unwrap();
        for body in ["a", "b", "c"] {
            broker.append("t", body.into()).await.unwrap();
        }

        let first = broker.read_next("t", "g", "c1", 2, BlockMode::Immediate).await.unwrap();
        let second = broker.read_next("t", "g", "c2", 2, BlockMode::Immediate).await.unwrap();
        let bodies: Vec<_> = first.iter().chain(second.iter()).map(|e| e.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
        assert!(first[0].id < first[1].id && first[1].id < second[0].id);

        // Independent group sees everything again
        let other = broker.read_next("t", "other", "x", 10, BlockMode::Immediate).await.unwrap();
        assert_eq!(other.len(), 3);
    }

    #[tokio::test]
    async fn test_ack_twice_is_harmless() {
        let broker = broker(60_000);
        broker.ensure_group("t", "g").await.unwrap();
        let id = broker.append("t", "a".into()).await.unwrap();
        broker.read_next("t", "g", "c", 1, BlockMode::Immediate).await.unwrap();

        assert_eq!(broker.pending_count("t", "g").await.unwrap(), 1);
        assert!(broker.ack("t", "g", id).await.unwrap());
        assert!(!broker.ack("t", "g", id).await.unwrap());
        assert_eq!(broker.pending_count("t", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redelivers_idle_entry_ahead_of_new_ones() {
        let broker = broker(30);
        broker.ensure_group("t", "g").await.unwrap();
        let crashed = broker.append("t", "a".into()).await.unwrap();
        broker.read_next("t", "g", "c1", 1, BlockMode::Immediate).await.unwrap();
        broker.append("t", "b".into()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let batch = broker.read_next("t", "g", "c2", 1, BlockMode::Immediate).await.unwrap();
        assert_eq!(batch[0].id, crashed);
        assert_eq!(batch[0].delivery_count, 2);
        assert_eq!(broker.pending_owner("t", "g", crashed).as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_read_requires_group() {
        let broker = broker(60_000);
        let err = broker.read_next("t", "g", "c", 1, BlockMode::Immediate).await.unwrap_err();
        assert!(matches!(err, Error::GroupNotFound { .. }));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let broker = Arc::new(MemoryBroker::new(&BrokerConfig {
            poll_interval_ms: 60_000,
            reclaim_idle_ms: 60_000,
        }));
        broker.ensure_group("t", "g").await.unwrap();

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.read_next("t", "g", "c", 1, BlockMode::Indefinitely).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.append("t", "wake".into()).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader woke up")
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].body, "wake");
    }

    #[tokio::test]
    async fn test_timeout_read_returns_empty() {
        let broker = broker(60_000);
        broker.ensure_group("t", "g").await.unwrap();
        let batch = broker
            .read_next("t", "g", "c", 1, BlockMode::Timeout(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_entries_lists_without_claiming() {
        let broker = broker(60_000);
        let first = broker.append("dlq", "x".into()).await.unwrap();
        broker.append("dlq", "y".into()).await.unwrap();

        let all = broker.entries("dlq", None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let rest = broker.entries("dlq", Some(first), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, "y");
        assert!(broker.entries("missing", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_store_compare_and_set() {
        let store = MemoryRecordStore::new();
        let id = Uuid::new_v4();
        let record = DocumentRecord::uploaded(id, "a.pdf", store.payload_ref(id));
        store.create(&record, b"bytes").await.unwrap();
        assert!(store.create(&record, b"bytes").await.is_err());

        let patch = RecordPatch::transition(DocumentStatus::Uploaded, DocumentStatus::OcrPending);
        assert_eq!(store.update(id, patch.clone()).await.unwrap(), PatchOutcome::Applied);
        assert_eq!(
            store.update(id, patch).await.unwrap(),
            PatchOutcome::Conflict { actual: DocumentStatus::OcrPending }
        );
        assert_eq!(
            store
                .update(Uuid::new_v4(), RecordPatch::default())
                .await
                .unwrap(),
            PatchOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_record_store_delete_payload() {
        let store = MemoryRecordStore::new();
        let id = Uuid::new_v4();
        store
            .create(&DocumentRecord::uploaded(id, "a.pdf", store.payload_ref(id)), b"bytes")
            .await
            .unwrap();

        assert!(store.delete_payload(id).await.unwrap());
        assert!(!store.delete_payload(id).await.unwrap());
        assert!(store.get_payload(id).await.unwrap().is_none());
        assert!(store.get(id).await.unwrap().unwrap().content_ref.is_none());

        assert!(store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
        assert!(!store.delete(id).await.unwrap());
    }
}
