//! Stage 1: recognize text in the uploaded payload

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::stage::{StageHandler, StageOutcome};
use crate::providers::Recognizer;
use crate::types::{DocumentRecord, DocumentStatus, PatchOutcome, RecordPatch, Stage};

use super::{expect_applied, HandlerContext};

/// `UPLOADED -> OCR_PENDING -> OCR_COMPLETED | OCR_FAILED`
pub struct RecognitionHandler {
    ctx: HandlerContext,
    recognizer: Arc<dyn Recognizer>,
}

impl RecognitionHandler {
    pub fn new(ctx: HandlerContext, recognizer: Arc<dyn Recognizer>) -> Self {
        Self { ctx, recognizer }
    }

    async fn recognize(&self, record: &DocumentRecord) -> Result<()> {
        let payload = self
            .ctx
            .store
            .get_payload(record.id)
            .await?
            .ok_or_else(|| Error::precondition(format!("payload for {} is missing", record.id)))?;

        let result = self.recognizer.recognize(&record.filename, &payload).await?;
        tracing::info!(
            document_id = %record.id,
            recognizer = self.recognizer.name(),
            confidence = result.confidence,
            chars = result.text.len(),
            "Recognition complete"
        );

        let (from, to) = (DocumentStatus::OcrPending, DocumentStatus::OcrCompleted);
        let outcome = self
            .ctx
            .store
            .update(record.id, RecordPatch::transition(from, to).with_recognition(result))
            .await?;
        expect_applied(outcome, from, to)
    }
}

#[async_trait]
impl StageHandler for RecognitionHandler {
    fn stage(&self) -> Stage {
        Stage::Recognition
    }

    async fn handle(&self, document_id: Uuid) -> Result<StageOutcome> {
        let stage = self.stage();
        let Some(record) = self.ctx.store.get(document_id).await? else {
            return self.ctx.record_missing(stage, document_id).await;
        };

        let output = DocumentStatus::OcrCompleted;
        if record.status == output {
            return self
                .ctx
                .resume(stage, &self.ctx.topics.ocr_result, document_id, output)
                .await;
        }

        let expected = DocumentStatus::Uploaded;
        if record.status != expected {
            return self
                .ctx
                .lost_race(stage, document_id, expected, record.status)
                .await;
        }

        match self
            .ctx
            .store
            .update(document_id, RecordPatch::transition(expected, DocumentStatus::OcrPending))
            .await?
        {
            PatchOutcome::Applied => {}
            PatchOutcome::Missing => return self.ctx.record_missing(stage, document_id).await,
            PatchOutcome::Conflict { actual } => {
                return self.ctx.lost_race(stage, document_id, expected, actual).await
            }
        }

        if let Err(e) = self.recognize(&record).await {
            self.ctx
                .mark_failed(stage, document_id, DocumentStatus::OcrPending, DocumentStatus::OcrFailed)
                .await;
            return self.ctx.dead_letter(stage, document_id, &e).await;
        }

        // A failed emit leaves the entry pending; redelivery re-emits from OCR_COMPLETED
        self.ctx
            .forward(&self.ctx.topics.ocr_result, document_id, output)
            .await?;
        Ok(StageOutcome::Forwarded(output))
    }
}
