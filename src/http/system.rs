//! Operational endpoints: health, metrics, cache control, consistency.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::errors::CoreError;
use crate::monitor::CheckKind;

use super::{ApiError, AppState};

/// Per-component health. Returns 200 while degraded; 503 only when the
/// storage backend is unreachable.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let probe = tokio::time::timeout(Duration::from_secs(5), state.backend.ping()).await;
    let database_healthy = matches!(probe, Ok(Ok(())));
    let database = match probe {
        Ok(Ok(())) => json!({ "status": "healthy" }),
        Ok(Err(err)) => json!({ "status": "unhealthy", "error": err.to_string() }),
        Err(_) => json!({ "status": "unhealthy", "error": "health probe timed out" }),
    };

    let cache_stats = state.cache.stats();
    let overall = if database_healthy { "healthy" } else { "unhealthy" };
    let status = if database_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": overall,
            "components": {
                "database": database,
                "cache": {
                    "status": "healthy",
                    "entries": cache_stats.entries,
                    "hit_rate": cache_stats.hit_rate,
                },
                "llm": {
                    "status": if state.config.llm.endpoint.is_some() { "configured" } else { "mock" },
                },
                "embedding": {
                    "status": if state.config.embedding.endpoint.is_some() { "configured" } else { "mock" },
                    "model": state.config.embedding.model_name,
                },
            },
        })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    if !state.config.monitoring.metrics_enabled {
        return Json(json!({ "enabled": false }));
    }
    Json(json!({
        "enabled": true,
        "operations": state.perf.snapshot(),
        "cache": state.cache.stats(),
    }))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.cache.stats()).unwrap_or_default())
}

pub async fn cache_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.cache.flush();
    Json(json!({ "cleared": true }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckRequest {
    /// A single check name; absent runs every check.
    #[serde(default)]
    pub check: Option<String>,
}

pub async fn consistency_check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reports = match request.check.as_deref() {
        None => state.consistency.run_all().await?,
        Some(raw) => {
            let kind = parse_check(raw)?;
            vec![state.consistency.run_check(kind).await?]
        }
    };
    Ok(Json(json!({ "reports": reports })))
}

#[derive(Debug, Deserialize)]
pub struct RepairRequest {
    pub check: String,
}

pub async fn consistency_repair(
    State(state): State<AppState>,
    Json(request): Json<RepairRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = parse_check(&request.check)?;
    let outcome = state.consistency.repair(kind).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(CoreError::from)?))
}

fn parse_check(raw: &str) -> Result<CheckKind, ApiError> {
    CheckKind::parse(raw).ok_or_else(|| {
        ApiError(CoreError::validation_with(
            format!("unknown consistency check '{raw}'"),
            json!({
                "known_checks": CheckKind::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            }),
        ))
    })
}
