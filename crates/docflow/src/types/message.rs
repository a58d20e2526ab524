//! Queue entry schema
//!
//! The broker stores entry bodies opaquely; stages exchange these typed
//! messages encoded as JSON objects with named fields.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::DocumentStatus;
use crate::error::{Error, Result};

/// Broker-assigned, monotonically increasing entry identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry as handed out by a broker read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    /// Encoded message body
    pub body: String,
    /// 1 on first delivery, incremented on every reclaim
    pub delivery_count: u32,
}

impl StreamEntry {
    /// Decode the body into a typed message
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Pipeline stage names, used for dead-letter attribution and routing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recognition,
    Validation,
    Persistence,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Recognition, Stage::Validation, Stage::Persistence];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Recognition => "recognition",
            Stage::Validation => "validation",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recognition" | "ocr" => Ok(Stage::Recognition),
            "validation" | "extraction" => Ok(Stage::Validation),
            "persistence" => Ok(Stage::Persistence),
            other => Err(Error::InvalidInput(format!("Unknown stage: {}", other))),
        }
    }
}

/// Normal-flow entry: a document moved into `status` and is ready for the next stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMessage {
    pub document_id: Uuid,
    pub status: DocumentStatus,
}

impl FlowMessage {
    pub fn new(document_id: Uuid, status: DocumentStatus) -> Self {
        Self {
            document_id,
            status,
        }
    }
}

/// The part of a normal-flow entry a stage acts on
///
/// Only `documentId` is required; `status` is informational and other
/// fields are ignored, so producers may evolve the body freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub document_id: Uuid,
}

/// Entry written to a stage's dead-letter topic for manual inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub document_id: Uuid,
    pub stage: Stage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn new(document_id: Uuid, stage: Stage, error: impl Into<String>) -> Self {
        Self {
            document_id,
            stage,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}
