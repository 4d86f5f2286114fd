//! Shared test harness: the full component stack over the in-memory
//! backend and the deterministic mock AI clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chunkloom::cache::QueryCache;
use chunkloom::clients::{EmbeddingProvider, MockEmbeddingProvider, MockLlmClient};
use chunkloom::config::ServerConfig;
use chunkloom::http::{AppState, router};
use chunkloom::ingest::IngestPipeline;
use chunkloom::model::{Chunk, ChunkId, IngestStatus};
use chunkloom::monitor::{ConsistencyMonitor, PerfMonitor};
use chunkloom::search::SearchEngine;
use chunkloom::storage::{MemoryBackend, StorageBackend};
use chunkloom::store::ChunkStore;

pub struct Harness {
    pub config: Arc<ServerConfig>,
    pub backend: Arc<dyn StorageBackend>,
    pub store: Arc<ChunkStore>,
    pub search: Arc<SearchEngine>,
    pub pipeline: Arc<IngestPipeline>,
    pub cache: Arc<QueryCache>,
    pub consistency: Arc<ConsistencyMonitor>,
    pub perf: Arc<PerfMonitor>,
    pub embedder: Arc<MockEmbeddingProvider>,
}

pub fn harness() -> Harness {
    let config = Arc::new(ServerConfig::default());
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let cache = Arc::new(QueryCache::new(&config.cache));
    let perf = Arc::new(PerfMonitor::new(&config.monitoring));
    let store = Arc::new(ChunkStore::new(
        Arc::clone(&backend),
        Arc::clone(&cache),
        Arc::clone(&perf),
    ));
    let embedder = Arc::new(MockEmbeddingProvider::new());
    let llm = Arc::new(MockLlmClient::new());
    let search = Arc::new(SearchEngine::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        embedder.clone(),
        Arc::clone(&cache),
        Arc::clone(&perf),
    ));
    let pipeline = IngestPipeline::new(
        Arc::clone(&store),
        Arc::clone(&backend),
        llm.clone(),
        llm,
        embedder.clone(),
        Arc::clone(&cache),
        config.ingest.clone(),
    );
    let consistency = Arc::new(ConsistencyMonitor::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        Arc::clone(&pipeline),
        embedder.model_name().to_string(),
    ));

    Harness {
        config,
        backend,
        store,
        search,
        pipeline,
        cache,
        consistency,
        perf,
        embedder,
    }
}

impl Harness {
    pub fn app_state(&self) -> AppState {
        AppState {
            config: Arc::clone(&self.config),
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            search: Arc::clone(&self.search),
            pipeline: Arc::clone(&self.pipeline),
            cache: Arc::clone(&self.cache),
            consistency: Arc::clone(&self.consistency),
            perf: Arc::clone(&self.perf),
        }
    }

    /// Polls a document root until its pipeline reaches a terminal state.
    pub async fn wait_terminal(&self, root: ChunkId) -> Chunk {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let chunk = self.store.get_chunk(root).await.expect("root must exist");
            match IngestStatus::of(&chunk) {
                Some(status) if !status.is_pending() => return chunk,
                _ => {}
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "document {root} never reached a terminal state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Serves the app on an ephemeral port and returns its base URL.
pub async fn spawn_server(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let app = router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    (format!("http://{addr}"), handle)
}
