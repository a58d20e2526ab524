//! Document status state machine
//!
//! Every status write in the system goes through [`DocumentStatus::can_transition_to`];
//! record stores reject writes that are not an edge of this graph. The graph is
//! acyclic, so a record can never revisit a state it has left.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lifecycle status of a document record (wire values are SCREAMING_SNAKE_CASE)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Created by ingress, payload stored, waiting for recognition
    Uploaded,
    /// Recognition stage owns the record
    OcrPending,
    /// Recognition result stored
    OcrCompleted,
    /// Recognition failed (terminal)
    OcrFailed,
    /// Extraction/validation stage owns the record
    ValidationPending,
    /// All field checks passed
    Validated,
    /// At least one field check failed; still routed to persistence
    ValidationFailed,
    /// Reserved; no handler writes it
    PersistencePending,
    /// Terminal success
    Persisted,
    /// Terminal failure after validation
    Failed,
}

impl DocumentStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [DocumentStatus; 10] = [
        Self::Uploaded,
        Self::OcrPending,
        Self::OcrCompleted,
        Self::OcrFailed,
        Self::ValidationPending,
        Self::Validated,
        Self::ValidationFailed,
        Self::PersistencePending,
        Self::Persisted,
        Self::Failed,
    ];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "UPLOADED",
            Self::OcrPending => "OCR_PENDING",
            Self::OcrCompleted => "OCR_COMPLETED",
            Self::OcrFailed => "OCR_FAILED",
            Self::ValidationPending => "VALIDATION_PENDING",
            Self::Validated => "VALIDATED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::PersistencePending => "PERSISTENCE_PENDING",
            Self::Persisted => "PERSISTED",
            Self::Failed => "FAILED",
        }
    }

    /// Statuses directly reachable from this one
    pub fn successors(&self) -> &'static [DocumentStatus] {
        use DocumentStatus::*;
        match self {
            Uploaded => &[OcrPending],
            OcrPending => &[OcrCompleted, OcrFailed],
            OcrCompleted => &[ValidationPending],
            ValidationPending => &[Validated, ValidationFailed],
            // Persistence failure on a validated record lands in FAILED
            Validated => &[Persisted, Failed],
            ValidationFailed => &[Failed],
            OcrFailed | PersistencePending | Persisted | Failed => &[],
        }
    }

    /// Whether `next` is a legal edge from this status
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        self.successors().contains(&next)
    }

    /// Whether the record has finished its lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OcrFailed | Self::Persisted | Self::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::storage(format!("Unknown document status: {}", s)))
    }
}
