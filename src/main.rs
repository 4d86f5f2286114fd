use std::sync::Arc;

use chunkloom::cache::QueryCache;
use chunkloom::clients::{
    Chunker, EmbeddingProvider, EntityExtractor, HttpEmbeddingProvider, HttpLlmClient,
    MockEmbeddingProvider, MockLlmClient,
};
use chunkloom::config::{ServerConfig, StorageKind};
use chunkloom::errors::CoreError;
use chunkloom::http::{AppState, router};
use chunkloom::ingest::IngestPipeline;
use chunkloom::monitor::{ConsistencyMonitor, PerfMonitor};
use chunkloom::search::SearchEngine;
use chunkloom::storage::{MemoryBackend, RestBackend, StorageBackend};
use chunkloom::store::ChunkStore;
use chunkloom::telemetry;

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    telemetry::init(&config.log);

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), CoreError> {
    let config = Arc::new(config);

    let backend: Arc<dyn StorageBackend> = match config.storage.kind {
        StorageKind::Memory => {
            tracing::warn!("using the in-memory storage backend; data will not survive restarts");
            Arc::new(MemoryBackend::new())
        }
        StorageKind::Rest => {
            let url = config
                .storage
                .url
                .as_deref()
                .ok_or_else(|| CoreError::internal("STORAGE_URL missing for rest backend"))?;
            let key = config
                .storage
                .api_key
                .as_deref()
                .ok_or_else(|| CoreError::internal("STORAGE_API_KEY missing for rest backend"))?;
            Arc::new(RestBackend::new(url, key, config.read_timeout)?)
        }
    };

    let (chunker, extractor): (Arc<dyn Chunker>, Arc<dyn EntityExtractor>) =
        match (&config.llm.endpoint, &config.llm.api_key) {
            (Some(endpoint), Some(key)) => {
                let client = Arc::new(HttpLlmClient::new(endpoint, key, config.llm.timeout)?);
                (client.clone(), client)
            }
            _ => {
                tracing::warn!("LLM endpoint not configured; using the deterministic mock chunker");
                let client = Arc::new(MockLlmClient::new());
                (client.clone(), client)
            }
        };

    let embedder: Arc<dyn EmbeddingProvider> =
        match (&config.embedding.endpoint, &config.embedding.api_key) {
            (Some(endpoint), Some(key)) => Arc::new(HttpEmbeddingProvider::new(
                endpoint,
                key,
                &config.embedding.model_name,
                config.embedding.dimension,
                config.embedding.timeout,
            )?),
            _ => {
                tracing::warn!(
                    "embedding endpoint not configured; using the deterministic mock provider"
                );
                Arc::new(MockEmbeddingProvider::new())
            }
        };

    let cache = Arc::new(QueryCache::new(&config.cache));
    let perf = Arc::new(PerfMonitor::new(&config.monitoring));
    let store = Arc::new(ChunkStore::new(
        Arc::clone(&backend),
        Arc::clone(&cache),
        Arc::clone(&perf),
    ));
    let search = Arc::new(SearchEngine::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        Arc::clone(&embedder),
        Arc::clone(&cache),
        Arc::clone(&perf),
    ));
    let pipeline = IngestPipeline::new(
        Arc::clone(&store),
        Arc::clone(&backend),
        chunker,
        extractor,
        Arc::clone(&embedder),
        Arc::clone(&cache),
        config.ingest.clone(),
    );
    let consistency = Arc::new(ConsistencyMonitor::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        Arc::clone(&pipeline),
        config.embedding.model_name.clone(),
    ));

    let mut background = Vec::new();
    if config.cache.enabled {
        background.push(cache.spawn_sweeper(config.cache.cleanup_interval));
    }
    if config.monitoring.monitoring_enabled {
        background.push(consistency.spawn_reporter(config.monitoring.consistency_interval));
    }

    match store.recover_journals().await {
        Ok(0) => {}
        Ok(rolled_back) => tracing::warn!(rolled_back, "recovered uncommitted journals"),
        Err(err) => tracing::warn!(error = %err, "journal recovery failed"),
    }

    match pipeline.resume_pending().await {
        Ok(0) => {}
        Ok(resumed) => tracing::info!(resumed, "re-enqueued interrupted ingest jobs"),
        Err(err) => tracing::warn!(error = %err, "could not resume pending ingest jobs"),
    }

    let state = AppState {
        config: Arc::clone(&config),
        backend,
        store,
        search,
        pipeline,
        cache,
        consistency,
        perf,
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| CoreError::internal(format!("failed to bind {addr}: {err}")))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| CoreError::internal(format!("server error: {err}")))?;

    tracing::info!("listener closed, stopping background tasks");
    for task in background {
        task.abort();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("could not install the ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not install the SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl-c received, draining"),
        _ = terminate => tracing::info!("SIGTERM received, draining"),
    }
}
