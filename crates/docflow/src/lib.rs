//! docflow: staged document processing over a durable log
//!
//! Uploaded documents move through recognition, extraction/validation and
//! persistence. Stages are connected by append-only topics with consumer
//! groups, so each stage runs as an independently scalable worker that
//! survives crashes through redelivery. A status state machine with
//! compare-and-set transitions keeps concurrent workers from driving a
//! record outside its lifecycle.

pub mod config;
pub mod error;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use processing::{IngestService, Pipeline, PipelineHandle};
pub use types::{DocumentRecord, DocumentStatus, FlowMessage, Stage};
