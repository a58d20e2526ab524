//! SQLite provider implementations over the shared [`PipelineDb`]
//!
//! `PipelineDb` calls are synchronous, so each one runs on the blocking pool.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::storage::PipelineDb;
use crate::types::{DocumentRecord, EntryId, PatchOutcome, RecordPatch, StreamEntry};

use super::broker::{wait_for_entries, BlockMode, StreamBroker};
use super::record_store::RecordStore;

/// Record store persisted in the pipeline database
pub struct SqliteRecordStore {
    db: Arc<PipelineDb>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<PipelineDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(&self, record: &DocumentRecord, payload: &[u8]) -> Result<()> {
        let db = self.db.clone();
        let record = record.clone();
        let payload = payload.to_vec();
        tokio::task::spawn_blocking(move || db.insert_document(&record, &payload))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.get_document(id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<PatchOutcome> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.update_document(id, &patch))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn get_payload(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.get_payload(id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn delete_payload(&self, id: Uuid) -> Result<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.delete_payload(id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.delete_document(id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    fn payload_ref(&self, id: Uuid) -> String {
        format!("sqlite://document_payloads/{}", id)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

/// Durable broker persisted in the pipeline database
///
/// Appends made through this handle wake blocked readers immediately; appends
/// made by other processes are picked up on the next poll.
pub struct SqliteBroker {
    db: Arc<PipelineDb>,
    notify: Notify,
    poll_interval: Duration,
    reclaim_idle: Duration,
}

impl SqliteBroker {
    pub fn new(db: Arc<PipelineDb>, config: &BrokerConfig) -> Self {
        Self {
            db,
            notify: Notify::new(),
            poll_interval: config.poll_interval(),
            reclaim_idle: config.reclaim_idle(),
        }
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let db = self.db.clone();
        let (topic, group, consumer) = (topic.to_string(), group.to_string(), consumer.to_string());
        let reclaim_idle = self.reclaim_idle;
        tokio::task::spawn_blocking(move || {
            db.claim_entries(&topic, &group, &consumer, max_count, reclaim_idle)
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl StreamBroker for SqliteBroker {
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<bool> {
        let db = self.db.clone();
        let (topic, group) = (topic.to_string(), group.to_string());
        tokio::task::spawn_blocking(move || db.ensure_group(&topic, &group))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn read_next(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: BlockMode,
    ) -> Result<Vec<StreamEntry>> {
        wait_for_entries(&self.notify, self.poll_interval, block, || {
            self.claim(topic, group, consumer, max_count)
        })
        .await
    }

    async fn append(&self, topic: &str, body: String) -> Result<EntryId> {
        let db = self.db.clone();
        let topic = topic.to_string();
        let id = tokio::task::spawn_blocking(move || db.append_entry(&topic, &body))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))??;
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<bool> {
        let db = self.db.clone();
        let (topic, group) = (topic.to_string(), group.to_string());
        tokio::task::spawn_blocking(move || db.ack_entry(&topic, &group, id))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn entries(
        &self,
        topic: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>> {
        let db = self.db.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || db.list_entries(&topic, after, limit))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
        let db = self.db.clone();
        let (topic, group) = (topic.to_string(), group.to_string());
        tokio::task::spawn_blocking(move || db.pending_count(&topic, &group))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
