//! Document upload and status endpoints

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::SubmitReceipt;
use crate::server::state::AppState;
use crate::types::{DocumentRecord, DocumentStatus, ExtractedFields, RecognitionResult};

/// Record as exposed over HTTP; the payload itself is never returned
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub id: Uuid,
    pub status: DocumentStatus,
    pub filename: String,
    /// Whether the payload is still held
    pub has_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition_result: Option<RecognitionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<ExtractedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DocumentRecord> for DocumentView {
    fn from(record: DocumentRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            filename: record.filename,
            has_payload: record.content_ref.is_some(),
            recognition_result: record.recognition_result,
            extracted_fields: record.extracted_fields,
            validation_errors: record.validation_errors,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// POST /api/documents - Upload one document
pub async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitReceipt>)> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        Error::InvalidInput(format!("Failed to read multipart field: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("upload_{}.bin", Uuid::new_v4()));

        let data = field.bytes().await.map_err(|e| {
            Error::InvalidInput(format!("Failed to read file {}: {}", filename, e))
        })?;

        let receipt = state.ingest().submit(&filename, &data).await?;
        return Ok((StatusCode::ACCEPTED, Json(receipt)));
    }

    Err(Error::InvalidInput("multipart field 'file' is required".to_string()))
}

/// GET /api/documents/:id - Current status and extracted data
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentView>> {
    let record = state.ingest().status(id).await?;
    Ok(Json(record.into()))
}

#[cfg(test)]
mod tests {
    use crate::config::{PipelineConfig, StorageBackend};
    use crate::processing::Pipeline;
    use crate::server::DocflowServer;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "docflow-test-boundary";

    fn pipeline() -> Pipeline {
        let config = PipelineConfig {
            backend: StorageBackend::Memory,
            ..Default::default()
        };
        Pipeline::from_config(config).unwrap()
    }

    fn upload_request(field: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"invoice.pdf\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::post("/api/documents")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_get() {
        let pipeline = pipeline();
        let router = DocflowServer::new(&pipeline).router();

        let response = router
            .clone()
            .oneshot(upload_request("file", b"%PDF-1.7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let receipt = json(response).await;
        assert_eq!(receipt["status"], "UPLOADED");
        let id = receipt["documentId"].as_str().unwrap().to_string();

        let response = router
            .oneshot(
                Request::get(format!("/api/documents/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view = json(response).await;
        assert_eq!(view["id"], id);
        assert_eq!(view["filename"], "invoice.pdf");
        assert_eq!(view["hasPayload"], true);
        assert!(view.get("contentRef").is_none());
    }

    #[tokio::test]
    async fn test_upload_empty_file_is_rejected() {
        let router = DocflowServer::new(&pipeline()).router();
        let response = router.oneshot(upload_request("file", b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"]["type"], "invalid_input");
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let router = DocflowServer::new(&pipeline()).router();
        let response = router.oneshot(upload_request("attachment", b"x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_document_is_404() {
        let router = DocflowServer::new(&pipeline()).router();
        let response = router
            .oneshot(
                Request::get(format!("/api/documents/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"]["type"], "not_found");
    }
}
