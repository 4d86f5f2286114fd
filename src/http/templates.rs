//! Template CRUD, instantiation, and slot updates.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::model::{Chunk, ChunkId};

use super::{ApiError, AppState, PageParams, envelope};

#[derive(Debug, Deserialize)]
pub struct CreateTemplate {
    pub template_name: String,
    #[serde(default)]
    pub slot_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstance {
    pub instance_name: String,
    #[serde(default)]
    pub slot_values: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct SetSlot {
    pub slot_name: String,
    pub value: String,
}

fn template_view(template: &Chunk, slots: &[Chunk]) -> serde_json::Value {
    json!({
        "template": template,
        "slots": slots,
    })
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateTemplate>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (template, slots) = state
        .store
        .create_template(&request.template_name, &request.slot_names)
        .await?;
    Ok((StatusCode::CREATED, Json(template_view(&template, &slots))))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (templates, total) = state
        .store
        .list_templates(params.page_size(), params.offset())
        .await?;
    Ok(Json(envelope("templates", &templates, &params, total)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (template, slots) = state.store.template_with_slots(id).await?;
    Ok(Json(template_view(&template, &slots)))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_template(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn instantiate(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(request): Json<CreateInstance>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (instance, slots) = state
        .store
        .instantiate_template(id, &request.instance_name, &request.slot_values)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "instance": instance, "slots": slots })),
    ))
}

pub async fn instances(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Query(params): Query<PageParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (instances, total) = state
        .store
        .template_instances(id, params.page_size(), params.offset())
        .await?;
    Ok(Json(envelope("instances", &instances, &params, total)))
}

pub async fn set_slot(
    State(state): State<AppState>,
    Path(id): Path<ChunkId>,
    Json(request): Json<SetSlot>,
) -> Result<Json<Chunk>, ApiError> {
    let slot = state
        .store
        .set_slot_value(id, &request.slot_name, &request.value)
        .await?;
    Ok(Json(slot))
}
