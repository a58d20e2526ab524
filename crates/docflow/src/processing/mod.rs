//! Stage processing: the generic consumer loop, stage handlers and pipeline lifecycle

pub mod handlers;
mod ingress;
mod pipeline;
pub mod rules;
mod stage;

pub use handlers::{HandlerContext, PersistenceHandler, RecognitionHandler, ValidationHandler};
pub use ingress::{IngestService, SubmitReceipt};
pub use pipeline::{Pipeline, PipelineHandle};
pub use stage::{ProcessorStats, StageHandler, StageOutcome, StageProcessor};
