//! Stage 2: extract invoice fields and validate them

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::rules::{extract_fields, validate_fields};
use crate::processing::stage::{StageHandler, StageOutcome};
use crate::types::{DocumentRecord, DocumentStatus, PatchOutcome, RecordPatch, Stage};

use super::{expect_applied, HandlerContext};

/// `OCR_COMPLETED -> VALIDATION_PENDING -> VALIDATED | VALIDATION_FAILED`
///
/// Failed checks are a normal outcome and are forwarded to persistence like
/// successes; only unexpected errors are dead-lettered.
pub struct ValidationHandler {
    ctx: HandlerContext,
}

impl ValidationHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    async fn validate(&self, record: &DocumentRecord) -> Result<DocumentStatus> {
        let text = record
            .recognized_text()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::precondition("recognition result is missing or empty"))?;

        let fields = extract_fields(text);
        let errors = validate_fields(&fields);

        let from = DocumentStatus::ValidationPending;
        let (to, patch) = if errors.is_empty() {
            let to = DocumentStatus::Validated;
            (to, RecordPatch::transition(from, to).with_extracted_fields(fields))
        } else {
            tracing::info!(
                document_id = %record.id,
                errors = ?errors,
                "Validation checks failed"
            );
            let to = DocumentStatus::ValidationFailed;
            (
                to,
                RecordPatch::transition(from, to)
                    .with_extracted_fields(fields)
                    .with_validation_errors(errors),
            )
        };

        let outcome = self.ctx.store.update(record.id, patch).await?;
        expect_applied(outcome, from, to)?;
        Ok(to)
    }
}

#[async_trait]
impl StageHandler for ValidationHandler {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    async fn handle(&self, document_id: Uuid) -> Result<StageOutcome> {
        let stage = self.stage();
        let Some(record) = self.ctx.store.get(document_id).await? else {
            return self.ctx.record_missing(stage, document_id).await;
        };

        if matches!(
            record.status,
            DocumentStatus::Validated | DocumentStatus::ValidationFailed
        ) && record.extracted_fields.is_some()
        {
            return self
                .ctx
                .resume(stage, &self.ctx.topics.validation, document_id, record.status)
                .await;
        }

        let expected = DocumentStatus::OcrCompleted;
        if record.status != expected {
            return self
                .ctx
                .lost_race(stage, document_id, expected, record.status)
                .await;
        }

        match self
            .ctx
            .store
            .update(document_id, RecordPatch::transition(expected, DocumentStatus::ValidationPending))
            .await?
        {
            PatchOutcome::Applied => {}
            PatchOutcome::Missing => return self.ctx.record_missing(stage, document_id).await,
            PatchOutcome::Conflict { actual } => {
                return self.ctx.lost_race(stage, document_id, expected, actual).await
            }
        }

        let status = match self.validate(&record).await {
            Ok(status) => status,
            Err(e) => {
                self.ctx
                    .mark_failed(
                        stage,
                        document_id,
                        DocumentStatus::ValidationPending,
                        DocumentStatus::ValidationFailed,
                    )
                    .await;
                return self.ctx.dead_letter(stage, document_id, &e).await;
            }
        };

        // A failed emit leaves the entry pending; redelivery re-emits the written status
        self.ctx
            .forward(&self.ctx.topics.validation, document_id, status)
            .await?;
        Ok(StageOutcome::Forwarded(status))
    }
}
