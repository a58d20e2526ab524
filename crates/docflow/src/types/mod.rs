//! Core types for the document pipeline

pub mod document;
pub mod message;
pub mod status;

pub use document::{DocumentRecord, ExtractedFields, PatchOutcome, RecognitionResult, RecordPatch};
pub use message::{DeadLetterMessage, DocumentRef, EntryId, FlowMessage, Stage, StreamEntry};
pub use status::DocumentStatus;
