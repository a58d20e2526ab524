//! Provider abstractions for stream transport, record storage, and recognition
//!
//! This module provides trait-based abstractions that allow switching between
//! durable (SQLite) and process-local (memory) backends.

pub mod broker;
pub mod memory;
pub mod recognizer;
pub mod record_store;
pub mod sqlite;

pub use broker::{publish, BlockMode, StreamBroker};
pub use memory::{MemoryBroker, MemoryRecordStore};
pub use recognizer::{MockRecognizer, Recognizer, SAMPLE_INVOICE_TEXT};
pub use record_store::RecordStore;
pub use sqlite::{SqliteBroker, SqliteRecordStore};
