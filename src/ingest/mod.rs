//! Ingest pipeline: text → chunks → embeddings → graph → indexed.
//!
//! Each submission drives a per-document state machine persisted into the
//! root chunk's `metadata.status`, so a crashed or cancelled run resumes
//! from its last checkpoint. Embeddings and graph rows are derived data
//! keyed on chunk id; re-driving any stage is safe because every
//! downstream write is an idempotent upsert.
//!
//! Concurrency: a bounded number of submissions run at once (queue-full
//! surfaces as `RateLimited` to the caller); inside one submission,
//! embedding batches and entity extraction fan out over a fixed-width
//! worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::clients::{Chunker, EmbeddingProvider, EntityExtractor, ExtractionOutcome};
use crate::config::IngestConfig;
use crate::errors::CoreError;
use crate::model::{
    Chunk, ChunkId, ChunkPatch, EmbeddingRow, GraphEdge, GraphNode, IngestStatus, JsonMap,
    NewChunk, new_chunk_id,
};
use crate::storage::StorageBackend;
use crate::store::ChunkStore;

pub struct IngestPipeline {
    store: Arc<ChunkStore>,
    backend: Arc<dyn StorageBackend>,
    chunker: Arc<dyn Chunker>,
    extractor: Arc<dyn EntityExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<QueryCache>,
    config: IngestConfig,
    jobs: Arc<Semaphore>,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChunkStore>,
        backend: Arc<dyn StorageBackend>,
        chunker: Arc<dyn Chunker>,
        extractor: Arc<dyn EntityExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Arc<QueryCache>,
        config: IngestConfig,
    ) -> Arc<Self> {
        let jobs = Arc::new(Semaphore::new(config.max_jobs));
        Arc::new(IngestPipeline {
            store,
            backend,
            chunker,
            extractor,
            embedder,
            cache,
            config,
            jobs,
        })
    }

    /// Accepts a text submission: creates the document root with status
    /// `received` and spawns the processing job. Fails with `RateLimited`
    /// when every job slot is busy.
    pub async fn submit(
        self: &Arc<Self>,
        content: &str,
        title: Option<&str>,
    ) -> Result<Chunk, CoreError> {
        if content.trim().is_empty() {
            return Err(CoreError::validation("content cannot be empty"));
        }
        let permit = Arc::clone(&self.jobs).try_acquire_owned().map_err(|_| {
            CoreError::rate_limited(format!(
                "ingest queue full ({} jobs in flight)",
                self.config.max_jobs
            ))
        })?;

        let mut metadata = JsonMap::new();
        if let Some(title) = title {
            metadata.insert("title".into(), serde_json::json!(title));
        }
        IngestStatus::Received.write_to(&mut metadata);
        let root = self
            .store
            .create_chunk(NewChunk {
                metadata,
                ..NewChunk::text(content)
            })
            .await?;

        let pipeline = Arc::clone(self);
        let root_id = root.id;
        tokio::spawn(async move {
            pipeline.drive(root_id).await;
            drop(permit);
        });
        Ok(root)
    }

    /// Re-ingests an existing document after a content change: descendants
    /// are dropped, the root keeps its id, and the pipeline restarts.
    pub async fn resubmit(self: &Arc<Self>, root_id: ChunkId) -> Result<(), CoreError> {
        let permit = Arc::clone(&self.jobs)
            .try_acquire_owned()
            .map_err(|_| CoreError::rate_limited("ingest queue full"))?;

        let root = self.store.get_chunk(root_id).await?;
        for child in self.store.children(root.id).await? {
            self.store.delete_chunk(child.id).await?;
        }
        self.backend.delete_embeddings_for(root_id).await?;
        self.backend.delete_graph_for_chunk(root_id).await?;
        self.set_status(root_id, IngestStatus::Received).await?;

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.drive(root_id).await;
            drop(permit);
        });
        Ok(())
    }

    /// Re-enqueues every document left in a non-terminal state, e.g. after
    /// a crash. Called once at startup.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, CoreError> {
        let (pages, _) = self.store.list_pages(usize::MAX >> 1, 0).await?;
        let mut resumed = 0;
        for page in pages {
            let pending = IngestStatus::of(&page).is_some_and(IngestStatus::is_pending);
            if !pending {
                continue;
            }
            let permit = match Arc::clone(&self.jobs).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            tracing::info!(document = %page.id, status = ?IngestStatus::of(&page), "resuming interrupted ingest");
            let pipeline = Arc::clone(self);
            let root_id = page.id;
            tokio::spawn(async move {
                pipeline.drive(root_id).await;
                drop(permit);
            });
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Embeds specific chunks outside a full run (consistency repair).
    pub async fn embed_chunks(&self, chunk_ids: &[ChunkId]) -> Result<usize, CoreError> {
        let mut chunks = Vec::new();
        for id in chunk_ids {
            if let Some(chunk) = self.store.try_get_chunk(*id).await? {
                if chunk.is_content_bearing() {
                    chunks.push(chunk);
                }
            }
        }
        self.embed_missing(&chunks).await
    }

    // ── state machine ──────────────────────────────────────────────────

    /// Drives one document from its checkpoint to a terminal state.
    async fn drive(&self, root_id: ChunkId) {
        if let Err(err) = self.run(root_id).await {
            tracing::error!(document = %root_id, error = %err, "ingest failed");
            if let Err(mark_err) = self.mark_failed(root_id, &err).await {
                tracing::error!(document = %root_id, error = %mark_err, "could not record failure status");
            }
        }
    }

    async fn run(&self, root_id: ChunkId) -> Result<(), CoreError> {
        let root = self.store.get_chunk(root_id).await?;
        let mut status = IngestStatus::of(&root).unwrap_or(IngestStatus::Received);

        loop {
            status = match status {
                IngestStatus::Received => {
                    self.set_status(root_id, IngestStatus::Chunking).await?;
                    IngestStatus::Chunking
                }
                IngestStatus::Chunking => {
                    self.run_chunking(&root).await?;
                    self.set_status(root_id, IngestStatus::Embedding).await?;
                    IngestStatus::Embedding
                }
                IngestStatus::Embedding => {
                    self.run_embedding(root_id).await?;
                    self.set_status(root_id, IngestStatus::GraphExtracting)
                        .await?;
                    IngestStatus::GraphExtracting
                }
                IngestStatus::GraphExtracting => {
                    self.run_graph_extraction(root_id).await?;
                    self.set_status(root_id, IngestStatus::Indexed).await?;
                    tracing::info!(document = %root_id, "document indexed");
                    IngestStatus::Indexed
                }
                IngestStatus::Indexed | IngestStatus::Failed => break,
            };
        }

        self.cache.invalidate_chunk(root_id);
        Ok(())
    }

    /// Chunking stage: one LLM call, then one bulk write creating every
    /// child chunk. Span indentation builds the hierarchy: a span at
    /// indent n becomes a child of the latest span at indent n-1.
    async fn run_chunking(&self, root: &Chunk) -> Result<(), CoreError> {
        // Resume-safety: a previous run may have persisted the children
        // before crashing between stages.
        let existing = self.store.children(root.id).await?;
        if !existing.is_empty() {
            tracing::debug!(document = %root.id, children = existing.len(), "chunks already persisted, skipping chunking");
            return Ok(());
        }

        let spans = self.chunker.chunk_text(&root.content).await?;
        if spans.is_empty() {
            return Ok(());
        }

        let mut batch: Vec<NewChunk> = Vec::with_capacity(spans.len());
        // Stack of (indent, pre-assigned id) for parent resolution.
        let mut stack: Vec<(u32, ChunkId)> = Vec::new();
        let mut sibling_counters: HashMap<ChunkId, i64> = HashMap::new();

        for span in spans {
            while let Some((indent, _)) = stack.last() {
                if *indent >= span.indent_level {
                    stack.pop();
                } else {
                    break;
                }
            }
            let parent = stack.last().map(|(_, id)| *id).unwrap_or(root.id);
            let id = new_chunk_id();
            let sequence = sibling_counters.entry(parent).or_insert(0);
            *sequence += 1;
            batch.push(NewChunk {
                id: Some(id),
                parent_id: Some(parent),
                sequence_number: Some(*sequence),
                ..NewChunk::text(&span.content)
            });
            stack.push((span.indent_level, id));
        }

        let created = self.store.bulk_create(batch).await?;
        tracing::debug!(document = %root.id, chunks = created.len(), "chunking stage persisted chunks");
        Ok(())
    }

    /// Embedding stage: batch every content-bearing chunk that still lacks
    /// an embedding through the provider, fanned out over the worker pool.
    /// A failed batch is re-queued up to the configured retry budget.
    async fn run_embedding(&self, root_id: ChunkId) -> Result<(), CoreError> {
        let subtree = self.store.subtree(root_id).await?;
        let mut missing = Vec::new();
        for chunk in subtree.iter().filter(|c| c.is_content_bearing()) {
            let have = self
                .backend
                .get_embedding(chunk.id, self.embedder.model_name())
                .await?;
            if have.is_none() {
                missing.push(chunk.clone());
            }
        }
        self.embed_missing(&missing).await?;
        Ok(())
    }

    async fn embed_missing(&self, chunks: &[Chunk]) -> Result<usize, CoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let batches: Vec<Vec<Chunk>> = chunks
            .chunks(self.config.embed_batch_size.max(1))
            .map(|batch| batch.to_vec())
            .collect();

        let pool = Arc::new(Semaphore::new(self.config.worker_width));
        let mut tasks: JoinSet<Result<usize, CoreError>> = JoinSet::new();

        for batch in batches {
            let pool = Arc::clone(&pool);
            let embedder = Arc::clone(&self.embedder);
            let backend = Arc::clone(&self.backend);
            let retries = self.config.batch_retries;
            tasks.spawn(async move {
                let _slot = pool
                    .acquire()
                    .await
                    .map_err(|_| CoreError::internal("worker pool closed"))?;
                let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

                let mut attempt = 0;
                let vectors = loop {
                    attempt += 1;
                    match embedder.embed_batch(&texts).await {
                        Ok(vectors) => break vectors,
                        Err(err) if attempt <= retries => {
                            tracing::warn!(attempt, error = %err, "embedding batch failed, re-queueing");
                        }
                        Err(err) => return Err(err),
                    }
                };

                // Batches preserve input order, so zip is positional.
                for (chunk, vector) in batch.iter().zip(vectors) {
                    backend
                        .upsert_embedding(&EmbeddingRow::new(
                            chunk.id,
                            embedder.model_name(),
                            vector,
                        ))
                        .await?;
                }
                Ok(batch.len())
            });
        }

        let mut embedded = 0;
        while let Some(joined) = tasks.join_next().await {
            let count = joined
                .map_err(|err| CoreError::internal(format!("embedding worker panicked: {err}")))??;
            embedded += count;
        }
        Ok(embedded)
    }

    /// Graph stage: entity extraction per chunk over the worker pool.
    /// Node and edge ids derive from their content, so re-runs upsert the
    /// same rows instead of duplicating them.
    async fn run_graph_extraction(&self, root_id: ChunkId) -> Result<(), CoreError> {
        let subtree = self.store.subtree(root_id).await?;
        let targets: Vec<Chunk> = subtree
            .into_iter()
            .filter(|c| c.is_content_bearing())
            .collect();

        let pool = Arc::new(Semaphore::new(self.config.worker_width));
        let mut tasks: JoinSet<Result<(), CoreError>> = JoinSet::new();

        for chunk in targets {
            let pool = Arc::clone(&pool);
            let extractor = Arc::clone(&self.extractor);
            let backend = Arc::clone(&self.backend);
            tasks.spawn(async move {
                let _slot = pool
                    .acquire()
                    .await
                    .map_err(|_| CoreError::internal("worker pool closed"))?;
                let outcome = extractor.extract(&chunk.content).await?;
                persist_graph(backend.as_ref(), chunk.id, &outcome).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined
                .map_err(|err| CoreError::internal(format!("graph worker panicked: {err}")))??;
        }
        Ok(())
    }

    // ── status bookkeeping ─────────────────────────────────────────────

    async fn set_status(&self, root_id: ChunkId, status: IngestStatus) -> Result<(), CoreError> {
        let mut metadata = JsonMap::new();
        status.write_to(&mut metadata);
        if status != IngestStatus::Failed {
            // Clear any stale failure diagnostics from a previous run.
            metadata.insert("error".into(), serde_json::Value::Null);
        }
        self.store
            .update_chunk(
                root_id,
                ChunkPatch {
                    metadata: Some(metadata),
                    ..ChunkPatch::default()
                },
            )
            .await?;
        tracing::debug!(document = %root_id, status = %status, "ingest checkpoint");
        Ok(())
    }

    /// Terminal failure: record diagnostics, keep already-persisted chunks
    /// visible and queryable.
    async fn mark_failed(&self, root_id: ChunkId, err: &CoreError) -> Result<(), CoreError> {
        let mut metadata = JsonMap::new();
        IngestStatus::Failed.write_to(&mut metadata);
        metadata.insert(
            "error".into(),
            serde_json::json!({
                "kind": err.kind(),
                "message": err.to_string(),
            }),
        );
        self.store
            .update_chunk(
                root_id,
                ChunkPatch {
                    metadata: Some(metadata),
                    ..ChunkPatch::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Upserts one chunk's extraction outcome. Node ids hash from
/// `(chunk, entity name)` and edge ids from the full relation triple, so
/// the writes are idempotent per chunk.
async fn persist_graph(
    backend: &dyn StorageBackend,
    chunk_id: ChunkId,
    outcome: &ExtractionOutcome,
) -> Result<(), CoreError> {
    let mut node_ids: HashMap<&str, Uuid> = HashMap::new();
    for entity in &outcome.entities {
        let id = derived_id(&[chunk_id.to_string().as_str(), "node", &entity.name]);
        node_ids.insert(entity.name.as_str(), id);
        backend
            .upsert_graph_node(&GraphNode {
                id,
                chunk_id,
                name: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
                properties: entity.properties.clone(),
            })
            .await?;
    }
    for relation in &outcome.relations {
        let (Some(source), Some(target)) = (
            node_ids.get(relation.source.as_str()),
            node_ids.get(relation.target.as_str()),
        ) else {
            tracing::debug!(
                source = %relation.source,
                target = %relation.target,
                "relation references an entity the extractor did not return, skipping"
            );
            continue;
        };
        let id = derived_id(&[
            chunk_id.to_string().as_str(),
            "edge",
            &relation.source,
            &relation.relationship,
            &relation.target,
        ]);
        backend
            .upsert_graph_edge(&GraphEdge {
                id,
                source_node_id: *source,
                target_node_id: *target,
                relationship: relation.relationship.clone(),
                properties: relation.properties.clone(),
            })
            .await?;
    }
    Ok(())
}

/// Deterministic 128-bit id from a part list (FNV-1a over two lanes).
fn derived_id(parts: &[&str]) -> Uuid {
    let mut hi = 0xcbf29ce484222325u64;
    let mut lo = 0x811c9dc5u64;
    for part in parts {
        for byte in part.as_bytes() {
            hi ^= *byte as u64;
            hi = hi.wrapping_mul(0x100000001b3);
            lo = lo.wrapping_add(*byte as u64).wrapping_mul(0x01000193);
        }
        hi ^= 0x1f;
        lo ^= 0x2e;
    }
    Uuid::from_u64_pair(hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let chunk = new_chunk_id().to_string();
        let a = derived_id(&[&chunk, "node", "Ada"]);
        let b = derived_id(&[&chunk, "node", "Ada"]);
        let c = derived_id(&[&chunk, "node", "Babbage"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
