//! Tag add/remove/list endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId};
use crate::store::TagRef;

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct AddTagRequest {
    /// Tag by content; the tag chunk is created on first use.
    #[serde(default)]
    pub tag_content: Option<String>,
    /// Tag by an existing tag chunk's id.
    #[serde(default)]
    pub tag_chunk_id: Option<ChunkId>,
}

pub async fn add(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(request): Json<AddTagRequest>,
) -> Result<(StatusCode, Json<Chunk>), ApiError> {
    let tag = match (request.tag_content, request.tag_chunk_id) {
        (Some(content), None) => TagRef::Content(content),
        (None, Some(tag_id)) => TagRef::Id(tag_id),
        _ => {
            return Err(ApiError(CoreError::validation(
                "provide exactly one of tag_content or tag_chunk_id",
            )));
        }
    };
    let updated = state.store.add_tag(id, tag).await?;
    Ok((StatusCode::CREATED, Json(updated)))
}

pub async fn list_for_chunk(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tags = state.store.chunk_tags(id).await?;
    Ok(Json(json!({ "tags": tags })))
}

pub async fn remove(
    State(state): State<AppState>,
    Path((id, tag_id)): Path<(ChunkId, ChunkId)>,
) -> Result<Json<Chunk>, ApiError> {
    Ok(Json(state.store.remove_tag(id, tag_id).await?))
}
