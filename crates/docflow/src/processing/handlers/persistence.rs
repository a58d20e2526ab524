//! Stage 3: finalize the record

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::processing::stage::{StageHandler, StageOutcome};
use crate::types::{DocumentStatus, RecordPatch, Stage};

use super::{expect_applied, HandlerContext};

/// `VALIDATED -> PERSISTED` (payload discarded), `VALIDATION_FAILED -> FAILED`
pub struct PersistenceHandler {
    ctx: HandlerContext,
}

impl PersistenceHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn finalize(&self, document_id: Uuid, from: DocumentStatus, to: DocumentStatus) -> Result<()> {
        let outcome = self
            .ctx
            .store
            .update(document_id, RecordPatch::transition(from, to))
            .await?;
        expect_applied(outcome, from, to)?;
        tracing::info!(document_id = %document_id, status = %to, "Document finalized");
        Ok(())
    }
}

#[async_trait]
impl StageHandler for PersistenceHandler {
    fn stage(&self) -> Stage {
        Stage::Persistence
    }

    async fn handle(&self, document_id: Uuid) -> Result<StageOutcome> {
        let stage = self.stage();
        let Some(record) = self.ctx.store.get(document_id).await? else {
            return self.ctx.record_missing(stage, document_id).await;
        };
        let observed = record.status;

        let target = match observed {
            DocumentStatus::Validated => DocumentStatus::Persisted,
            DocumentStatus::ValidationFailed => DocumentStatus::Failed,
            other => {
                tracing::warn!(
                    document_id = %document_id,
                    status = %other,
                    "Unexpected status for persistence, skipping"
                );
                return Ok(StageOutcome::Skipped);
            }
        };

        if let Err(e) = self.finalize(document_id, observed, target).await {
            if observed.can_transition_to(DocumentStatus::Failed) {
                self.ctx
                    .mark_failed(stage, document_id, observed, DocumentStatus::Failed)
                    .await;
            }
            return self.ctx.dead_letter(stage, document_id, &e).await;
        }

        if target == DocumentStatus::Persisted {
            // Status stays PERSISTED even if the payload cannot be discarded
            match self.ctx.store.delete_payload(document_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(document_id = %document_id, "No payload to discard");
                }
                Err(e) => return self.ctx.dead_letter(stage, document_id, &e).await,
            }
        }

        Ok(StageOutcome::Finalized(target))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::providers::RecordStore;

    #[tokio::test]
    async fn test_validated_is_persisted_and_payload_discarded() {
        let fixture = Fixture::new();
        let record = fixture.seed(DocumentStatus::Validated, b"%PDF").await;

        let outcome = PersistenceHandler::new(fixture.ctx.clone())
            .handle(record.id)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Finalized(DocumentStatus::Persisted));

        let stored = fixture.store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Persisted);
        assert!(stored.content_ref.is_none());
        assert!(fixture.store.get_payload(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_failed_becomes_failed_and_keeps_payload() {
        let fixture = Fixture::new();
        let record = fixture.seed(DocumentStatus::ValidationFailed, b"%PDF").await;

        let outcome = PersistenceHandler::new(fixture.ctx.clone())
            .handle(record.id)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Finalized(DocumentStatus::Failed));
        assert_eq!(fixture.status(record.id).await, DocumentStatus::Failed);
        assert!(fixture.store.get_payload(record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_status_is_a_logged_no_op() {
        let fixture = Fixture::new();
        let record = fixture.seed(DocumentStatus::Persisted, b"%PDF").await;

        let outcome = PersistenceHandler::new(fixture.ctx.clone())
            .handle(record.id)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
        assert_eq!(fixture.status(record.id).await, DocumentStatus::Persisted);
        assert!(fixture.dead_letters(Stage::Persistence).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_document_is_dropped() {
        let fixture = Fixture::new();
        let outcome = PersistenceHandler::new(fixture.ctx.clone())
            .handle(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Dropped);
        assert!(fixture.dead_letters(Stage::Persistence).await.is_empty());
    }
}
