//! Document record and the typed deltas stages write against it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DocumentStatus;
use crate::error::{Error, Result};

/// Structured output of the recognition stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    /// Recognized text
    pub text: String,
    /// Confidence score in [0, 1]
    pub confidence: f32,
    /// Detected language (ISO 639-1)
    pub language: String,
}

/// Fields pulled out of recognized invoice text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_date: Option<String>,
}

/// The single mutable entity tracked across the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    /// Assigned at ingress, immutable
    pub id: Uuid,
    /// Current lifecycle status
    pub status: DocumentStatus,
    /// Original filename as uploaded
    pub filename: String,
    /// Reference to the stored payload; cleared once persistence discards it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    /// Set by the recognition stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition_result: Option<RecognitionResult>,
    /// Set by the extraction stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<ExtractedFields>,
    /// Set when validation fails
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Create a freshly uploaded record
    pub fn uploaded(id: Uuid, filename: impl Into<String>, content_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: DocumentStatus::Uploaded,
            filename: filename.into(),
            content_ref: Some(content_ref.into()),
            recognition_result: None,
            extracted_fields: None,
            validation_errors: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recognized text, if recognition stored any
    pub fn recognized_text(&self) -> Option<&str> {
        self.recognition_result.as_ref().map(|r| r.text.as_str())
    }
}

/// Result of applying a [`RecordPatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Patch written
    Applied,
    /// No record with that id
    Missing,
    /// The record was not in the status the transition expected
    Conflict { actual: DocumentStatus },
}

impl PatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied)
    }
}

/// Typed field deltas, optionally guarded by a status transition
///
/// A transition is a compare-and-set: it only applies if the record is
/// currently in `from`, and `from -> to` must be an edge of the status graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    transition: Option<(DocumentStatus, DocumentStatus)>,
    recognition_result: Option<RecognitionResult>,
    extracted_fields: Option<ExtractedFields>,
    validation_errors: Option<Vec<String>>,
}

impl RecordPatch {
    /// Patch that moves the record from `from` to `to`
    pub fn transition(from: DocumentStatus, to: DocumentStatus) -> Self {
        Self {
            transition: Some((from, to)),
            ..Default::default()
        }
    }

    pub fn with_recognition(mut self, result: RecognitionResult) -> Self {
        self.recognition_result = Some(result);
        self
    }

    pub fn with_extracted_fields(mut self, fields: ExtractedFields) -> Self {
        self.extracted_fields = Some(fields);
        self
    }

    pub fn with_validation_errors(mut self, errors: Vec<String>) -> Self {
        self.validation_errors = Some(errors);
        self
    }

    /// The guarded transition, if any
    pub fn status_transition(&self) -> Option<(DocumentStatus, DocumentStatus)> {
        self.transition
    }

    /// Check the guard against `record` and write the deltas into it
    ///
    /// Stores call this under whatever lock makes their read-modify-write atomic.
    pub fn apply_to(&self, record: &mut DocumentRecord) -> Result<PatchOutcome> {
        if let Some((from, to)) = self.transition {
            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition { from, to });
            }
            if record.status != from {
                return Ok(PatchOutcome::Conflict {
                    actual: record.status,
                });
            }
            record.status = to;
        }
        if let Some(result) = &self.recognition_result {
            record.recognition_result = Some(result.clone());
        }
        if let Some(fields) = &self.extracted_fields {
            record.extracted_fields = Some(fields.clone());
        }
        if let Some(errors) = &self.validation_errors {
            record.validation_errors = Some(errors.clone());
        }
        record.updated_at = Utc::now();
        Ok(PatchOutcome::Applied)
    }
}
