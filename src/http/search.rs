//! The five search endpoints.

use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::model::Subgraph;
use crate::search::{ChunkQuery, GraphQuery, HybridQuery, SemanticQuery, TagQuery};

use super::{ApiError, AppState};

pub async fn semantic(
    State(state): State<AppState>,
    Json(query): Json<SemanticQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state.search.semantic(&query).await?;
    let count = results.len();
    Ok(Json(json!({
        "results": results,
        "count": count,
    })))
}

pub async fn graph(
    State(state): State<AppState>,
    Json(query): Json<GraphQuery>,
) -> Result<Json<Subgraph>, ApiError> {
    Ok(Json(state.search.graph(&query).await?))
}

pub async fn tags(
    State(state): State<AppState>,
    Json(query): Json<TagQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chunks = state.search.tags(&query).await?;
    let count = chunks.len();
    Ok(Json(json!({
        "chunks": chunks,
        "count": count,
    })))
}

pub async fn chunks(
    State(state): State<AppState>,
    Json(query): Json<ChunkQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (chunks, total) = state.search.chunks(&query).await?;
    Ok(Json(json!({
        "chunks": chunks,
        "total": total,
    })))
}

pub async fn hybrid(
    State(state): State<AppState>,
    Json(query): Json<HybridQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state.search.hybrid(&query).await?;
    let count = results.len();
    Ok(Json(json!({
        "results": results,
        "count": count,
    })))
}
