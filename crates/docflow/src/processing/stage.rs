//! Generic stage processor: claim, handle, acknowledge

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::providers::{BlockMode, StreamBroker};
use crate::types::{DocumentRef, DocumentStatus, Stage, StreamEntry};

/// What a handler did with one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Record moved to `status` and was emitted to the next topic
    Forwarded(DocumentStatus),
    /// Record reached a terminal status; nothing emitted
    Finalized(DocumentStatus),
    /// Written to the stage's dead-letter topic
    DeadLettered,
    /// No record with that id
    Dropped,
    /// Record was in a status this stage ignores
    Skipped,
}

/// Transform contract implemented by each stage
///
/// A handler contains its own failures: it writes the failure status and
/// dead-letters the document. `Err` means the dead-letter append or the
/// forward after a written status failed; the entry stays unacknowledged and
/// the redelivery picks up from the stored status.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name for logging and dead-letter attribution
    fn stage(&self) -> Stage;

    /// Process one document
    async fn handle(&self, document_id: Uuid) -> Result<StageOutcome>;
}

/// Counters reported when a processor stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Entries handed to the handler and acknowledged
    pub handled: u64,
    /// Entries acknowledged without a usable document id
    pub malformed: u64,
    /// Infrastructure errors that triggered a retry pause
    pub retries: u64,
}

impl ProcessorStats {
    pub fn merge(&mut self, other: ProcessorStats) {
        self.handled += other.handled;
        self.malformed += other.malformed;
        self.retries += other.retries;
    }
}

/// One consumer of one `(topic, group)`
pub struct StageProcessor {
    topic: String,
    group: String,
    consumer: String,
    broker: Arc<dyn StreamBroker>,
    handler: Arc<dyn StageHandler>,
    retry_delay: Duration,
}

enum EntryResult {
    Handled(StageOutcome),
    Malformed,
}

impl StageProcessor {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        broker: Arc<dyn StreamBroker>,
        handler: Arc<dyn StageHandler>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
            broker,
            handler,
            retry_delay,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run until `cancel` fires
    ///
    /// Cancellation is observed while waiting for entries and between them;
    /// a handler that has started is allowed to finish.
    pub async fn run(self, cancel: CancellationToken) -> ProcessorStats {
        let stage = self.handler.stage();
        let mut stats = ProcessorStats::default();

        tracing::info!(
            stage = %stage,
            topic = %self.topic,
            group = %self.group,
            consumer = %self.consumer,
            "Stage processor started"
        );

        loop {
            match self.broker.ensure_group(&self.topic, &self.group).await {
                Ok(_) => break,
                Err(e) => {
                    tracing::error!(stage = %stage, topic = %self.topic, error = %e, "Failed to ensure consumer group");
                    stats.retries += 1;
                    if self.pause(&cancel).await {
                        return stats;
                    }
                }
            }
        }

        while !cancel.is_cancelled() {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = self.broker.read_next(
                    &self.topic,
                    &self.group,
                    &self.consumer,
                    1,
                    BlockMode::Indefinitely,
                ) => read,
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(stage = %stage, consumer = %self.consumer, error = %e, "Read failed, retrying");
                    stats.retries += 1;
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            for entry in entries {
                match self.process(&entry).await {
                    Ok(EntryResult::Handled(outcome)) => {
                        stats.handled += 1;
                        tracing::debug!(
                            stage = %stage,
                            entry_id = %entry.id,
                            outcome = ?outcome,
                            "Entry acknowledged"
                        );
                    }
                    Ok(EntryResult::Malformed) => stats.malformed += 1,
                    Err(e) => {
                        // Left unacknowledged; redelivered once idle long enough
                        tracing::error!(
                            stage = %stage,
                            entry_id = %entry.id,
                            delivery_count = entry.delivery_count,
                            transient = e.is_transient(),
                            error = %e,
                            "Entry processing failed, retrying"
                        );
                        stats.retries += 1;
                        if self.pause(&cancel).await {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(
            stage = %stage,
            consumer = %self.consumer,
            handled = stats.handled,
            malformed = stats.malformed,
            retries = stats.retries,
            "Stage processor stopped"
        );
        stats
    }

    async fn process(&self, entry: &StreamEntry) -> Result<EntryResult> {
        let message: DocumentRef = match entry.decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    stage = %self.handler.stage(),
                    entry_id = %entry.id,
                    error = %e,
                    "Skipping entry without a valid document id"
                );
                self.broker.ack(&self.topic, &self.group, entry.id).await?;
                return Ok(EntryResult::Malformed);
            }
        };

        if entry.delivery_count > 1 {
            tracing::warn!(
                stage = %self.handler.stage(),
                document_id = %message.document_id,
                delivery_count = entry.delivery_count,
                "Processing redelivered entry"
            );
        }

        let outcome = self.handler.handle(message.document_id).await?;
        self.broker.ack(&self.topic, &self.group, entry.id).await?;
        Ok(EntryResult::Handled(outcome))
    }

    /// Wait out the retry delay; returns `true` if cancelled meanwhile
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.retry_delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::error::Error;
    use crate::providers::{publish, MemoryBroker};
    use crate::types::FlowMessage;
    use parking_lot::Mutex;

    /// Records ids; fails the first `failures` calls
    struct RecordingHandler {
        seen: Mutex<Vec<Uuid>>,
        failures: Mutex<u32>,
    }

    impl RecordingHandler {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            })
        }
    }

    #[async_trait]
    impl StageHandler for RecordingHandler {
        fn stage(&self) -> Stage {
            Stage::Recognition
        }

        async fn handle(&self, document_id: Uuid) -> Result<StageOutcome> {
            self.seen.lock().push(document_id);
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::broker("dead-letter topic unavailable"));
            }
            Ok(StageOutcome::Forwarded(DocumentStatus::OcrCompleted))
        }
    }

    fn broker(reclaim_idle_ms: u64) -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::new(&BrokerConfig {
            poll_interval_ms: 10,
            reclaim_idle_ms,
        }))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_malformed_entry_is_acked_and_skipped() {
        let broker = broker(60_000);
        broker.ensure_group("in", "g").await.unwrap();
        let handler = RecordingHandler::new(0);
        let processor = StageProcessor::new(
            "in",
            "g",
            "c1",
            broker.clone(),
            handler.clone(),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(processor.run(cancel.clone()));

        broker.append("in", "{\"status\":\"UPLOADED\"}".into()).await.unwrap();
        let id = Uuid::new_v4();
        publish(broker.as_ref(), "in", &FlowMessage::new(id, DocumentStatus::Uploaded))
            .await
            .unwrap();

        wait_until(|| handler.seen.lock().len() == 1).await;
        cancel.cancel();
        let stats = task.await.unwrap();

        assert_eq!(*handler.seen.lock(), vec![id]);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(broker.pending_count("in", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entry_needs_only_a_document_id() {
        let broker = broker(60_000);
        broker.ensure_group("in", "g").await.unwrap();
        let handler = RecordingHandler::new(0);
        let processor = StageProcessor::new(
            "in",
            "g",
            "c1",
            broker.clone(),
            handler.clone(),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(processor.run(cancel.clone()));

        let (bare, odd_status) = (Uuid::new_v4(), Uuid::new_v4());
        broker
            .append("in", format!(r#"{{"documentId":"{}"}}"#, bare))
            .await
            .unwrap();
        broker
            .append("in", format!(r#"{{"documentId":"{}","status":"uploaded"}}"#, odd_status))
            .await
            .unwrap();

        wait_until(|| handler.seen.lock().len() == 2).await;
        cancel.cancel();
        let stats = task.await.unwrap();

        assert_eq!(*handler.seen.lock(), vec![bare, odd_status]);
        assert_eq!(stats.malformed, 0);
        assert_eq!(stats.handled, 2);
    }

    #[tokio::test]
    async fn test_handler_error_leaves_entry_for_redelivery() {
        let broker = broker(0);
        broker.ensure_group("in", "g").await.unwrap();
        let handler = RecordingHandler::new(1);
        let processor = StageProcessor::new(
            "in",
            "g",
            "c1",
            broker.clone(),
            handler.clone(),
            Duration::from_millis(10),
        );

        let id = Uuid::new_v4();
        publish(broker.as_ref(), "in", &FlowMessage::new(id, DocumentStatus::Uploaded))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(processor.run(cancel.clone()));

        wait_until(|| handler.seen.lock().len() == 2).await;
        cancel.cancel();
        let stats = task.await.unwrap();

        assert_eq!(*handler.seen.lock(), vec![id, id]);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(broker.pending_count("in", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_creates_group_and_stops_on_cancel() {
        let broker = broker(60_000);
        let processor = StageProcessor::new(
            "in",
            "g",
            "c1",
            broker.clone(),
            RecordingHandler::new(0),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(processor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!broker.ensure_group("in", "g").await.unwrap());

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("processor stopped")
            .unwrap();
        assert_eq!(stats, ProcessorStats::default());
    }
}
