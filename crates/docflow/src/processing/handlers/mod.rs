//! Concrete stage handlers and the context they share

mod persistence;
mod recognition;
mod validation;

pub use persistence::PersistenceHandler;
pub use recognition::RecognitionHandler;
pub use validation::ValidationHandler;

use std::sync::Arc;
use uuid::Uuid;

use crate::config::{PipelineConfig, TopicConfig};
use crate::error::{Error, Result};
use crate::providers::{publish, RecordStore, StreamBroker};
use crate::types::{DeadLetterMessage, DocumentStatus, FlowMessage, PatchOutcome, RecordPatch, Stage};

use super::stage::StageOutcome;

/// Store, broker and routing shared by all handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn RecordStore>,
    pub broker: Arc<dyn StreamBroker>,
    pub topics: TopicConfig,
    /// Dead-letter entries whose record does not exist instead of dropping them
    pub dead_letter_missing_records: bool,
}

impl HandlerContext {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn RecordStore>,
        broker: Arc<dyn StreamBroker>,
    ) -> Self {
        Self {
            store,
            broker,
            topics: config.topics.clone(),
            dead_letter_missing_records: config.processing.dead_letter_missing_records,
        }
    }

    /// Emit a normal-flow entry to `topic`
    async fn forward(&self, topic: &str, document_id: Uuid, status: DocumentStatus) -> Result<()> {
        publish(self.broker.as_ref(), topic, &FlowMessage::new(document_id, status)).await?;
        Ok(())
    }

    /// Re-emit a record that already holds this stage's output status
    ///
    /// The status write landed but the forward did not, so the entry was left
    /// unacknowledged. Downstream handlers tolerate the duplicate this causes
    /// when the first forward did land after all.
    async fn resume(&self, stage: Stage, topic: &str, document_id: Uuid, status: DocumentStatus) -> Result<StageOutcome> {
        tracing::warn!(
            stage = %stage,
            document_id = %document_id,
            status = %status,
            "Status already written, re-emitting to next stage"
        );
        self.forward(topic, document_id, status).await?;
        Ok(StageOutcome::Forwarded(status))
    }

    /// Append to the stage's dead-letter topic
    ///
    /// Its error propagates and leaves the entry unacknowledged.
    async fn dead_letter(&self, stage: Stage, document_id: Uuid, error: &Error) -> Result<StageOutcome> {
        tracing::error!(
            stage = %stage,
            document_id = %document_id,
            error = %error,
            "Dead-lettering document"
        );
        let message = DeadLetterMessage::new(document_id, stage, error.to_string());
        publish(self.broker.as_ref(), self.topics.dead_letter(stage), &message).await?;
        Ok(StageOutcome::DeadLettered)
    }

    /// No record for the entry's document id
    async fn record_missing(&self, stage: Stage, document_id: Uuid) -> Result<StageOutcome> {
        if self.dead_letter_missing_records {
            return self
                .dead_letter(stage, document_id, &Error::DocumentNotFound(document_id))
                .await;
        }
        tracing::warn!(stage = %stage, document_id = %document_id, "Record not found, dropping entry");
        Ok(StageOutcome::Dropped)
    }

    /// Another consumer moved the record first; it owns the status now
    async fn lost_race(
        &self,
        stage: Stage,
        document_id: Uuid,
        expected: DocumentStatus,
        actual: DocumentStatus,
    ) -> Result<StageOutcome> {
        let error = Error::precondition(format!(
            "expected status {}, found {}",
            expected, actual
        ));
        self.dead_letter(stage, document_id, &error).await
    }

    /// Write a failure status, but only while the record is still in `from`
    ///
    /// Never fails: a store error here is logged and the dead-letter entry
    /// still carries the original failure.
    async fn mark_failed(&self, stage: Stage, document_id: Uuid, from: DocumentStatus, to: DocumentStatus) {
        match self.store.update(document_id, RecordPatch::transition(from, to)).await {
            Ok(PatchOutcome::Applied) => {
                tracing::info!(stage = %stage, document_id = %document_id, status = %to, "Marked document failed");
            }
            Ok(PatchOutcome::Conflict { actual }) => {
                tracing::warn!(
                    stage = %stage,
                    document_id = %document_id,
                    status = %actual,
                    "Status moved on, leaving it unchanged"
                );
            }
            Ok(PatchOutcome::Missing) => {
                tracing::warn!(stage = %stage, document_id = %document_id, "Record vanished before failure status write");
            }
            Err(e) => {
                tracing::error!(stage = %stage, document_id = %document_id, error = %e, "Failed to write failure status");
            }
        }
    }
}

/// Require a transition to have been written
fn expect_applied(outcome: PatchOutcome, from: DocumentStatus, to: DocumentStatus) -> Result<()> {
    match outcome {
        PatchOutcome::Applied => Ok(()),
        PatchOutcome::Missing => Err(Error::precondition(format!(
            "record disappeared before {} -> {}",
            from, to
        ))),
        PatchOutcome::Conflict { actual } => Err(Error::precondition(format!(
            "status changed to {} before {} -> {}",
            actual, from, to
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::providers::{BlockMode, MemoryBroker, MemoryRecordStore};
    use crate::types::{DocumentRecord, EntryId, StreamEntry};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Memory broker whose appends to selected topics fail
    pub struct FlakyBroker {
        pub inner: Arc<MemoryBroker>,
        failing: Mutex<HashSet<String>>,
    }

    impl FlakyBroker {
        pub fn new(inner: Arc<MemoryBroker>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                failing: Mutex::new(HashSet::new()),
            })
        }

        pub fn fail_appends(&self, topic: &str) {
            self.failing.lock().insert(topic.to_string());
        }

        pub fn restore(&self, topic: &str) {
            self.failing.lock().remove(topic);
        }
    }

    #[async_trait]
    impl StreamBroker for FlakyBroker {
        async fn ensure_group(&self, topic: &str, group: &str) -> Result<bool> {
            self.inner.ensure_group(topic, group).await
        }

        async fn read_next(
            &self,
            topic: &str,
            group: &str,
            consumer: &str,
            max_count: usize,
            block: BlockMode,
        ) -> Result<Vec<StreamEntry>> {
            self.inner.read_next(topic, group, consumer, max_count, block).await
        }

        async fn append(&self, topic: &str, body: String) -> Result<EntryId> {
            if self.failing.lock().contains(topic) {
                return Err(Error::broker(format!("append to {} refused", topic)));
            }
            self.inner.append(topic, body).await
        }

        async fn ack(&self, topic: &str, group: &str, id: EntryId) -> Result<bool> {
            self.inner.ack(topic, group, id).await
        }

        async fn entries(&self, topic: &str, after: Option<EntryId>, limit: usize) -> Result<Vec<StreamEntry>> {
            self.inner.entries(topic, after, limit).await
        }

        async fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
            self.inner.pending_count(topic, group).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    pub struct Fixture {
        pub store: Arc<MemoryRecordStore>,
        pub broker: Arc<MemoryBroker>,
        pub ctx: HandlerContext,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_config(&PipelineConfig::default())
        }

        pub fn with_config(config: &PipelineConfig) -> Self {
            let store = Arc::new(MemoryRecordStore::new());
            let broker = Arc::new(MemoryBroker::new(&BrokerConfig::default()));
            let ctx = HandlerContext::new(config, store.clone(), broker.clone());
            Self { store, broker, ctx }
        }

        /// Handlers publish through a [`FlakyBroker`] over the fixture's broker
        pub fn flaky() -> (Self, Arc<FlakyBroker>) {
            let mut fixture = Self::new();
            let flaky = FlakyBroker::new(fixture.broker.clone());
            fixture.ctx.broker = flaky.clone();
            (fixture, flaky)
        }

        /// Create a record and force it into `status`
        pub async fn seed(&self, status: DocumentStatus, payload: &[u8]) -> DocumentRecord {
            let id = Uuid::new_v4();
            let mut record = DocumentRecord::uploaded(id, "invoice.pdf", self.store.payload_ref(id));
            record.status = status;
            self.store.create(&record, payload).await.unwrap();
            record
        }

        pub async fn topic(&self, topic: &str) -> Vec<StreamEntry> {
            self.broker.entries(topic, None, 100).await.unwrap()
        }

        pub async fn dead_letters(&self, stage: Stage) -> Vec<DeadLetterMessage> {
            self.topic(self.ctx.topics.dead_letter(stage))
                .await
                .iter()
                .map(|e| e.decode().unwrap())
                .collect()
        }

        pub async fn status(&self, id: Uuid) -> DocumentStatus {
            self.store.get(id).await.unwrap().unwrap().status
        }
    }
}
