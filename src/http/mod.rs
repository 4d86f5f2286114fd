//! HTTP surface: a thin axum layer binding the core components to the
//! REST endpoints. Handlers validate request shape, call one component,
//! and let [`error::ApiError`] translate failures.

mod chunks;
mod error;
mod pagination;
mod search;
mod system;
mod tags;
mod templates;
mod texts;

pub use error::ApiError;
pub use pagination::{PageParams, Pagination, envelope};

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};

use crate::cache::QueryCache;
use crate::config::ServerConfig;
use crate::ingest::IngestPipeline;
use crate::monitor::{ConsistencyMonitor, PerfMonitor};
use crate::search::SearchEngine;
use crate::storage::StorageBackend;
use crate::store::ChunkStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub backend: Arc<dyn StorageBackend>,
    pub store: Arc<ChunkStore>,
    pub search: Arc<SearchEngine>,
    pub pipeline: Arc<IngestPipeline>,
    pub cache: Arc<QueryCache>,
    pub consistency: Arc<ConsistencyMonitor>,
    pub perf: Arc<PerfMonitor>,
}

/// Builds the full router: operational endpoints at the root, the API
/// under `/api/v1`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // texts
        .route("/texts", post(texts::create).get(texts::list))
        .route(
            "/texts/{id}",
            get(texts::fetch).put(texts::update).delete(texts::remove),
        )
        .route(
            "/texts/{id}/structure",
            get(texts::structure).put(texts::replace_structure),
        )
        // chunks
        .route("/chunks", post(chunks::create).get(chunks::list))
        .route(
            "/chunks/{id}",
            get(chunks::fetch)
                .put(chunks::update)
                .patch(chunks::update)
                .delete(chunks::remove),
        )
        .route("/chunks/{id}/hierarchy", get(chunks::hierarchy))
        .route("/chunks/{id}/children", get(chunks::children))
        .route("/chunks/{id}/siblings", get(chunks::siblings))
        .route("/chunks/{id}/move", post(chunks::move_chunk))
        .route(
            "/chunks/batch",
            post(chunks::batch_create).put(chunks::batch_update),
        )
        // tags
        .route(
            "/chunks/{id}/tags",
            post(tags::add).get(tags::list_for_chunk),
        )
        .route("/chunks/{id}/tags/{tag_id}", delete(tags::remove))
        // templates & instances
        .route("/templates", post(templates::create).get(templates::list))
        .route(
            "/templates/{id}",
            get(templates::fetch).delete(templates::remove),
        )
        .route(
            "/templates/{id}/instances",
            post(templates::instantiate).get(templates::instances),
        )
        .route("/instances/{id}/slots", put(templates::set_slot))
        // search
        .route("/search/semantic", post(search::semantic))
        .route("/search/graph", post(search::graph))
        .route("/search/tags", post(search::tags))
        .route("/search/chunks", post(search::chunks))
        .route("/search/hybrid", post(search::hybrid));

    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .route("/cache/stats", get(system::cache_stats))
        .route("/cache/clear", post(system::cache_clear))
        .route("/consistency/check", post(system::consistency_check))
        .route("/consistency/repair", post(system::consistency_repair))
        .nest("/api/v1", api)
        .with_state(state)
}
