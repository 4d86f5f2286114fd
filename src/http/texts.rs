//! Text submission and retrieval: the document-level API.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, ChunkPatch, IngestStatus, JsonMap};
use crate::store::StructureNode;

use super::{ApiError, AppState, PageParams, envelope};

#[derive(Debug, Deserialize)]
pub struct CreateText {
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateText {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// The document view: the root chunk plus its coarse ingest status.
pub(super) fn text_view(chunk: &Chunk) -> serde_json::Value {
    json!({
        "id": chunk.id,
        "content": chunk.content,
        "title": chunk.metadata.get("title"),
        "status": IngestStatus::of(chunk).map(IngestStatus::api_label),
        "error": chunk.metadata.get("error"),
        "tags": chunk.tags,
        "created_at": chunk.created_at,
        "updated_at": chunk.updated_at,
    })
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateText>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let root = state
        .pipeline
        .submit(&request.content, request.title.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(text_view(&root))))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (pages, total) = state
        .store
        .list_pages(params.page_size(), params.offset())
        .await?;
    let views: Vec<serde_json::Value> = pages.iter().map(text_view).collect();
    Ok(Json(envelope("texts", &views, &params, total)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (page, descendants) = state.store.page_with_descendants(id).await?;
    require_page(&page)?;
    Ok(Json(json!({
        "text": text_view(&page),
        "chunks": descendants,
    })))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(request): Json<UpdateText>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state.store.get_chunk(id).await?;
    require_page(&page)?;

    let mut metadata = JsonMap::new();
    if let Some(title) = &request.title {
        metadata.insert("title".into(), json!(title));
    }
    let content_changed = request
        .content
        .as_ref()
        .is_some_and(|content| content != &page.content);

    let patch = ChunkPatch {
        content: request.content.clone(),
        metadata: if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        },
        ..ChunkPatch::default()
    };
    let updated = if patch.is_empty() {
        page
    } else {
        state.store.update_chunk(id, patch).await?
    };

    // A content change invalidates every derived representation; re-run
    // the pipeline under the same root id.
    if content_changed {
        state.pipeline.resubmit(id).await?;
    }
    let fresh = state.store.get_chunk(updated.id).await?;
    Ok(Json(text_view(&fresh)))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<StatusCode, ApiError> {
    let page = state.store.get_chunk(id).await?;
    require_page(&page)?;
    state.store.delete_chunk(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn structure(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<StructureNode>, ApiError> {
    let page = state.store.get_chunk(id).await?;
    require_page(&page)?;
    Ok(Json(state.store.structure_of(id).await?))
}

pub async fn replace_structure(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(tree): Json<StructureNode>,
) -> Result<Json<StructureNode>, ApiError> {
    Ok(Json(state.store.replace_structure(id, tree).await?))
}

fn require_page(chunk: &Chunk) -> Result<(), ApiError> {
    if chunk.is_page {
        Ok(())
    } else {
        Err(ApiError(CoreError::not_found("text", chunk.id)))
    }
}
