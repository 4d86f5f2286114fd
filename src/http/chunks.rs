//! Chunk CRUD, hierarchy navigation, move, and batch endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, ChunkPatch, NewChunk};
use crate::storage::ChunkFilter;
use crate::store::BulkDelta;

use super::{ApiError, AppState, PageParams, envelope};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub parent_id: Option<ChunkId>,
    #[serde(default)]
    pub page_ref: Option<ChunkId>,
    #[serde(default)]
    pub is_template: Option<bool>,
    #[serde(default)]
    pub is_tag: Option<bool>,
}

impl ListQuery {
    fn paging(&self) -> PageParams {
        PageParams {
            page: self.page,
            page_size: self.page_size,
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    Json(new): Json<NewChunk>,
) -> Result<(StatusCode, Json<Chunk>), ApiError> {
    let chunk = state.store.create_chunk(new).await?;
    Ok((StatusCode::CREATED, Json(chunk)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let paging = query.paging();
    let filter = ChunkFilter {
        parent_id: query.parent_id,
        page_ref: query.page_ref,
        is_template: query.is_template,
        is_tag: query.is_tag,
        limit: Some(paging.page_size()),
        offset: paging.offset(),
        ..ChunkFilter::default()
    };
    let (chunks, total) = state.store.list(&filter).await?;
    Ok(Json(envelope("chunks", &chunks, &paging, total)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<Chunk>, ApiError> {
    Ok(Json(state.store.get_chunk(id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(patch): Json<ChunkPatch>,
) -> Result<Json<Chunk>, ApiError> {
    Ok(Json(state.store.update_chunk(id, patch).await?))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_chunk(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Ancestor chain from the document root down to the chunk.
pub async fn hierarchy(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chain = state.store.ancestor_chain(id).await?;
    Ok(Json(json!({ "chunks": chain })))
}

pub async fn children(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let children = state.store.children(id).await?;
    Ok(Json(json!({ "chunks": children })))
}

pub async fn siblings(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let siblings = state.store.siblings(id).await?;
    Ok(Json(json!({ "chunks": siblings })))
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    #[serde(default)]
    pub new_parent_id: Option<ChunkId>,
    #[serde(default)]
    pub new_position: Option<i64>,
    /// Optional cross-check against the indent level the move yields.
    #[serde(default)]
    pub new_indent_level: Option<u32>,
}

pub async fn move_chunk(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<Chunk>, ApiError> {
    // Indent cross-check happens before the move so a mismatch leaves the
    // tree untouched.
    if let Some(expected) = request.new_indent_level {
        let target_indent = match request.new_parent_id {
            Some(parent) => state.store.get_chunk(parent).await?.indent_level + 1,
            None => 0,
        };
        if expected != target_indent {
            return Err(ApiError(CoreError::validation_with(
                format!(
                    "indent level {expected} does not match hierarchy depth {target_indent}"
                ),
                json!({ "expected": expected, "actual": target_indent }),
            )));
        }
    }
    let moved = state
        .store
        .move_chunk(id, request.new_parent_id, request.new_position)
        .await?;
    Ok(Json(moved))
}

pub async fn batch_create(
    State(state): State<AppState>,
    Json(batch): Json<Vec<NewChunk>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let created = state.store.bulk_create(batch).await?;
    Ok((StatusCode::CREATED, Json(json!({ "chunks": created }))))
}

pub async fn batch_update(
    State(state): State<AppState>,
    Json(deltas): Json<Vec<BulkDelta>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state.store.bulk_update(deltas).await?;
    Ok(Json(json!({ "chunks": updated })))
}
