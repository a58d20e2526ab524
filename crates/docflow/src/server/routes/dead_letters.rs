//! Dead-letter inspection endpoint

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::server::state::AppState;
use crate::types::{DeadLetterMessage, EntryId, Stage};

const MAX_LIMIT: usize = 1000;

/// Query parameters for listing dead letters
#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    /// Only entries after this entry id
    pub after: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// One dead-lettered document
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItem {
    pub entry_id: EntryId,
    pub document_id: Uuid,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Response for dead-letter listing
#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub stage: Stage,
    pub topic: String,
    pub entries: Vec<DeadLetterItem>,
}

/// GET /api/dead-letters/:stage - Entries on a stage's dead-letter topic
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterListResponse>> {
    let stage: Stage = stage.parse()?;
    let topic = state.config().topics.dead_letter(stage).to_string();
    let limit = query.limit.clamp(1, MAX_LIMIT);

    let raw = state
        .broker()
        .entries(&topic, query.after.map(EntryId), limit)
        .await?;

    let entries = raw
        .into_iter()
        .filter_map(|entry| match entry.decode::<DeadLetterMessage>() {
            Ok(message) => Some(DeadLetterItem {
                entry_id: entry.id,
                document_id: message.document_id,
                error: message.error,
                failed_at: message.failed_at,
            }),
            Err(e) => {
                tracing::warn!(topic = %topic, entry_id = %entry.id, error = %e, "Undecodable dead-letter entry");
                None
            }
        })
        .collect();

    Ok(Json(DeadLetterListResponse {
        stage,
        topic,
        entries,
    }))
}
