//! Record store provider trait for document records and their payloads

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DocumentRecord, PatchOutcome, RecordPatch};

/// Trait for keyed document storage
///
/// Implementations:
/// - `SqliteRecordStore`: durable, shares the pipeline database
/// - `MemoryRecordStore`: process-local
///
/// There is no record-level locking. Status changes go through
/// [`RecordPatch::transition`], which every implementation applies as an
/// atomic compare-and-set and rejects when it is not an edge of the status graph.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a new record and its payload
    async fn create(&self, record: &DocumentRecord, payload: &[u8]) -> Result<()>;

    /// Read a whole record
    async fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>>;

    /// Apply typed field deltas
    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<PatchOutcome>;

    /// Read the payload bytes
    async fn get_payload(&self, id: Uuid) -> Result<Option<Vec<u8>>>;

    /// Discard the payload and clear the record's content reference
    ///
    /// Returns whether a payload existed.
    async fn delete_payload(&self, id: Uuid) -> Result<bool>;

    /// Remove a record and its payload; used to roll back an unpublished upload
    ///
    /// Returns whether the record existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Content reference recorded for a payload stored by this provider
    fn payload_ref(&self, id: Uuid) -> String;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
