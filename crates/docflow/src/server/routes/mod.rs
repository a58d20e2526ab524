//! API routes for the docflow server

pub mod dead_letters;
pub mod documents;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Upload, with larger body limit for payloads
        .route(
            "/documents",
            post(documents::upload_document).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/documents/:id", get(documents::get_document))
        .route("/dead-letters/:stage", get(dead_letters::list_dead_letters))
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "docflow",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Document pipeline: recognition, extraction/validation, persistence",
        "endpoints": {
            "POST /api/documents": "Upload a document (multipart field 'file')",
            "GET /api/documents/:id": "Get document status and extracted data",
            "GET /api/dead-letters/:stage": "List dead-lettered documents (ocr | validation | persistence)"
        }
    }))
}
