//! Ingress: register uploads and publish them to the first stage

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::providers::{publish, RecordStore, StreamBroker};
use crate::types::{DocumentRecord, DocumentStatus, FlowMessage};

/// Returned to the uploader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub document_id: Uuid,
    pub status: DocumentStatus,
}

/// Creates `UPLOADED` records and feeds the recognition topic
#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn RecordStore>,
    broker: Arc<dyn StreamBroker>,
    topic: String,
}

impl IngestService {
    pub fn new(store: Arc<dyn RecordStore>, broker: Arc<dyn StreamBroker>, topic: impl Into<String>) -> Self {
        Self {
            store,
            broker,
            topic: topic.into(),
        }
    }

    /// Store the payload, create the record and publish it to stage 1
    ///
    /// If the publish fails the record is removed again and the error returned,
    /// so the caller can resubmit.
    pub async fn submit(&self, filename: &str, payload: &[u8]) -> Result<SubmitReceipt> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(Error::InvalidInput("filename is required".to_string()));
        }
        if payload.is_empty() {
            return Err(Error::InvalidInput(format!("'{}' is empty", filename)));
        }

        let id = Uuid::new_v4();
        let record = DocumentRecord::uploaded(id, filename, self.store.payload_ref(id));
        self.store.create(&record, payload).await?;

        if let Err(e) = publish(
            self.broker.as_ref(),
            &self.topic,
            &FlowMessage::new(id, DocumentStatus::Uploaded),
        )
        .await
        {
            // An unpublished record would sit at UPLOADED forever
            match self.store.delete(id).await {
                Ok(_) => tracing::error!(document_id = %id, error = %e, "Publish failed, upload rolled back"),
                Err(cleanup) => tracing::error!(
                    document_id = %id,
                    error = %e,
                    cleanup_error = %cleanup,
                    "Publish failed and the record could not be removed"
                ),
            }
            return Err(e);
        }

        tracing::info!(
            document_id = %id,
            filename,
            bytes = payload.len(),
            "Document submitted"
        );

        Ok(SubmitReceipt {
            document_id: id,
            status: record.status,
        })
    }

    /// Current record for `id`
    pub async fn status(&self, id: Uuid) -> Result<DocumentRecord> {
        self.store.get(id).await?.ok_or(Error::DocumentNotFound(id))
    }
}
