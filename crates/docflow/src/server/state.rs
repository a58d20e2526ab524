//! Application state for the HTTP server

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::processing::{IngestService, Pipeline};
use crate::providers::{RecordStore, StreamBroker};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: PipelineConfig,
    /// Ingress into the recognition topic
    ingest: IngestService,
    /// Record store (status lookups)
    store: Arc<dyn RecordStore>,
    /// Broker (dead-letter inspection)
    broker: Arc<dyn StreamBroker>,
    /// Ready state
    ready: RwLock<bool>,
}

impl AppState {
    /// Create state sharing the pipeline's store and broker
    pub fn new(pipeline: &Pipeline) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config: pipeline.config().clone(),
                ingest: pipeline.ingest(),
                store: pipeline.store().clone(),
                broker: pipeline.broker().clone(),
                ready: RwLock::new(true),
            }),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Get ingest service
    pub fn ingest(&self) -> &IngestService {
        &self.inner.ingest
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    pub fn broker(&self) -> &Arc<dyn StreamBroker> {
        &self.inner.broker
    }

    /// Check if the server is ready
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Set ready state
    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}
