//! Pipeline composition: backends, handlers and worker lifecycle

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{PipelineConfig, StorageBackend};
use crate::error::Result;
use crate::providers::{
    MemoryBroker, MemoryRecordStore, MockRecognizer, Recognizer, RecordStore, SqliteBroker,
    SqliteRecordStore, StreamBroker,
};
use crate::storage::PipelineDb;
use crate::types::Stage;

use super::handlers::{HandlerContext, PersistenceHandler, RecognitionHandler, ValidationHandler};
use super::ingress::IngestService;
use super::stage::{ProcessorStats, StageHandler, StageProcessor};

/// The three stages wired to one store and one broker
pub struct Pipeline {
    config: PipelineConfig,
    ctx: HandlerContext,
    recognizer: Arc<dyn Recognizer>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        broker: Arc<dyn StreamBroker>,
        recognizer: Arc<dyn Recognizer>,
    ) -> Self {
        let ctx = HandlerContext::new(&config, store, broker);
        Self {
            config,
            ctx,
            recognizer,
        }
    }

    /// Build the configured backend and the stand-in recognizer
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let (store, broker): (Arc<dyn RecordStore>, Arc<dyn StreamBroker>) = match config.backend {
            StorageBackend::Sqlite => {
                let db = Arc::new(PipelineDb::new(&config.storage.database_path)?);
                tracing::info!(path = %config.storage.database_path.display(), "Opened pipeline database");
                (
                    Arc::new(SqliteRecordStore::new(db.clone())),
                    Arc::new(SqliteBroker::new(db, &config.broker)),
                )
            }
            StorageBackend::Memory => (
                Arc::new(MemoryRecordStore::new()),
                Arc::new(MemoryBroker::new(&config.broker)),
            ),
        };
        let recognizer = Arc::new(MockRecognizer::from_config(&config.recognition));

        Ok(Self::new(config, store, broker, recognizer))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.ctx.store
    }

    pub fn broker(&self) -> &Arc<dyn StreamBroker> {
        &self.ctx.broker
    }

    /// Ingress feeding the recognition topic
    pub fn ingest(&self) -> IngestService {
        IngestService::new(
            self.ctx.store.clone(),
            self.ctx.broker.clone(),
            self.config.topics.input(Stage::Recognition),
        )
    }

    /// Handler for one stage
    pub fn handler(&self, stage: Stage) -> Arc<dyn StageHandler> {
        match stage {
            Stage::Recognition => Arc::new(RecognitionHandler::new(
                self.ctx.clone(),
                self.recognizer.clone(),
            )),
            Stage::Validation => Arc::new(ValidationHandler::new(self.ctx.clone())),
            Stage::Persistence => Arc::new(PersistenceHandler::new(self.ctx.clone())),
        }
    }

    /// Create every stage's consumer group
    ///
    /// Groups start at the tail, so this must happen before ingress appends
    /// anything the stages are expected to see.
    pub async fn ensure_groups(&self) -> Result<()> {
        let topics = &self.config.topics;
        for stage in Stage::ALL {
            let created = self
                .ctx
                .broker
                .ensure_group(topics.input(stage), topics.group(stage))
                .await?;
            if created {
                tracing::info!(
                    stage = %stage,
                    topic = topics.input(stage),
                    group = topics.group(stage),
                    "Created consumer group"
                );
            }
        }
        Ok(())
    }

    /// Ensure groups, then spawn `workers_per_stage` processors per stage
    pub async fn start(&self) -> Result<PipelineHandle> {
        self.ensure_groups().await?;

        let cancel = CancellationToken::new();
        let topics = &self.config.topics;
        let workers_per_stage = self.config.processing.workers_per_stage;
        let mut workers = Vec::with_capacity(Stage::ALL.len() * workers_per_stage);

        for stage in Stage::ALL {
            let handler = self.handler(stage);
            for n in 0..workers_per_stage {
                let processor = StageProcessor::new(
                    topics.input(stage),
                    topics.group(stage),
                    format!("{}-{}-{}", stage, std::process::id(), n),
                    self.ctx.broker.clone(),
                    handler.clone(),
                    self.config.processing.retry_delay(),
                );
                workers.push(tokio::spawn(processor.run(cancel.child_token())));
            }
        }

        tracing::info!(
            backend = self.ctx.broker.name(),
            workers = workers.len(),
            "Pipeline started"
        );

        Ok(PipelineHandle { cancel, workers })
    }
}

/// Running workers
pub struct PipelineHandle {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<ProcessorStats>>,
}

impl PipelineHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Token cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all workers, waiting at most `grace` for in-flight handlers
    pub async fn shutdown(self, grace: Duration) -> ProcessorStats {
        self.cancel.cancel();
        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        let mut total = ProcessorStats::default();

        match tokio::time::timeout(grace, join_all(self.workers)).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(stats) => total.merge(stats),
                        Err(e) => tracing::error!(error = %e, "Stage worker panicked"),
                    }
                }
                tracing::info!(
                    handled = total.handled,
                    malformed = total.malformed,
                    retries = total.retries,
                    "Pipeline stopped"
                );
            }
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs_f64(),
                    "Workers still busy after grace period, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        total
    }
}
