//! Search and retrieval: semantic, graph, tag, lexical chunk, and hybrid.
//!
//! Semantic queries embed the query text (cached and coalesced, keyed by
//! text + model), over-fetch from the vector index, threshold, and
//! truncate. Hybrid runs semantic and lexical retrieval in parallel and
//! combines them under client-supplied weights. Ordering is deterministic
//! everywhere: score descending, then smaller chunk id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, QueryCache};
use crate::clients::EmbeddingProvider;
use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, Subgraph};
use crate::monitor::PerfMonitor;
use crate::storage::{ChunkFilter, StorageBackend, VectorFilter};
use crate::store::{ChunkStore, TagRef};

/// Vector-index depth cap: never pull more than this many candidates.
const MAX_CANDIDATES: usize = 100;
/// Graph traversal depth cap.
const MAX_GRAPH_DEPTH: u32 = 5;

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub page_id: Option<ChunkId>,
    /// Include template/slot chunks in the candidate set.
    #[serde(default)]
    pub include_templates: bool,
    #[serde(default)]
    pub indent_min: Option<u32>,
    #[serde(default)]
    pub indent_max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_similarity: f32,
    #[serde(default)]
    pub filter: SearchFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQuery {
    pub entity: String,
    #[serde(default = "GraphQuery::default_depth")]
    pub max_depth: u32,
    #[serde(default = "GraphQuery::default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub relation_types: Vec<String>,
}

impl GraphQuery {
    fn default_depth() -> u32 {
        2
    }
    fn default_limit() -> usize {
        50
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagOperator {
    And,
    Or,
}

impl Default for TagOperator {
    fn default() -> Self {
        TagOperator::Or
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagQuery {
    pub tags: Vec<String>,
    #[serde(default)]
    pub operator: TagOperator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkQuery {
    pub query: String,
    #[serde(default)]
    pub filter: SearchFilter,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridQuery {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "HybridQuery::default_weight")]
    pub semantic_weight: f32,
    #[serde(default = "HybridQuery::default_weight")]
    pub lexical_weight: f32,
}

impl HybridQuery {
    fn default_weight() -> f32 {
        0.5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridHit {
    pub chunk: Chunk,
    pub semantic_score: f32,
    pub lexical_score: f32,
    pub combined_score: f32,
}

pub struct SearchEngine {
    backend: Arc<dyn StorageBackend>,
    store: Arc<ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<QueryCache>,
    perf: Arc<PerfMonitor>,
}

impl SearchEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        store: Arc<ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Arc<QueryCache>,
        perf: Arc<PerfMonitor>,
    ) -> Self {
        SearchEngine {
            backend,
            store,
            embedder,
            cache,
            perf,
        }
    }

    // ── semantic ───────────────────────────────────────────────────────

    pub async fn semantic(&self, query: &SemanticQuery) -> Result<Vec<ScoredChunk>, CoreError> {
        let started = Instant::now();
        let result = self.semantic_inner(query).await;
        self.perf.record(
            "search.semantic",
            started.elapsed(),
            result.as_ref().map(Vec::len).unwrap_or(0),
            result.is_err(),
        );
        result
    }

    async fn semantic_inner(&self, query: &SemanticQuery) -> Result<Vec<ScoredChunk>, CoreError> {
        if query.query.trim().is_empty() {
            return Err(CoreError::validation("query cannot be empty"));
        }
        // Result sets cache under the full argument fingerprint, scoped to
        // the chunks (and their pages) the results came from, so a write
        // to any of them drops the entry.
        let key = CacheKey::of("semantic_search", query);
        self.cache
            .get_or_compute(key, || async {
                let results = self.semantic_uncached(query).await?;
                let mut scope: Vec<ChunkId> = Vec::new();
                for result in &results {
                    scope.push(result.chunk.id);
                    scope.extend(result.chunk.page_ref);
                }
                Ok((results, scope))
            })
            .await
    }

    async fn semantic_uncached(
        &self,
        query: &SemanticQuery,
    ) -> Result<Vec<ScoredChunk>, CoreError> {
        let limit = query.limit.clamp(1, MAX_CANDIDATES);

        let vector = self.query_embedding(&query.query).await?;
        let candidates = limit.saturating_mul(5).min(MAX_CANDIDATES);
        let filter = VectorFilter {
            model_name: self.embedder.model_name().to_string(),
            page_ref: query.filter.page_id,
            exclude_templates: !query.filter.include_templates,
            indent_min: query.filter.indent_min,
            indent_max: query.filter.indent_max,
        };
        let hits = self
            .backend
            .nearest_neighbors(&vector, candidates, &filter)
            .await?;

        let mut results = Vec::with_capacity(limit);
        for hit in hits {
            if hit.similarity < query.min_similarity {
                continue;
            }
            if results.len() >= limit {
                break;
            }
            if let Some(chunk) = self.store.try_get_chunk(hit.chunk_id).await? {
                results.push(ScoredChunk {
                    chunk,
                    similarity: hit.similarity,
                });
            }
        }
        Ok(results)
    }

    /// Query embedding, cached by (model, text) with coalesced misses so a
    /// storm of identical cold queries costs one provider call.
    async fn query_embedding(&self, text: &str) -> Result<Vec<f32>, CoreError> {
        let key = CacheKey::of(
            "query_embedding",
            &(self.embedder.model_name(), text),
        );
        let embedder = Arc::clone(&self.embedder);
        let owned = text.to_string();
        self.cache
            .get_or_compute(key, move || async move {
                let vector = embedder.embed_one(&owned).await?;
                Ok((vector, Vec::new()))
            })
            .await
    }

    // ── graph ──────────────────────────────────────────────────────────

    pub async fn graph(&self, query: &GraphQuery) -> Result<Subgraph, CoreError> {
        if query.entity.trim().is_empty() {
            return Err(CoreError::validation("entity cannot be empty"));
        }
        let depth = query.max_depth.min(MAX_GRAPH_DEPTH);
        let limit = query.limit.clamp(1, 500);
        let started = Instant::now();
        let result = self
            .backend
            .graph_traverse(&query.entity, depth, &query.relation_types, limit)
            .await;
        self.perf.record(
            "search.graph",
            started.elapsed(),
            result.as_ref().map(|s| s.nodes.len()).unwrap_or(0),
            result.is_err(),
        );
        result
    }

    // ── tags ───────────────────────────────────────────────────────────

    /// Resolves tag contents to tag chunks, then intersects (AND) or
    /// unions (OR) their source sets from the tag index.
    pub async fn tags(&self, query: &TagQuery) -> Result<Vec<Chunk>, CoreError> {
        if query.tags.is_empty() {
            return Err(CoreError::validation("at least one tag is required"));
        }
        let started = Instant::now();
        let result = self.tags_inner(query).await;
        self.perf.record(
            "search.tags",
            started.elapsed(),
            result.as_ref().map(Vec::len).unwrap_or(0),
            result.is_err(),
        );
        result
    }

    async fn tags_inner(&self, query: &TagQuery) -> Result<Vec<Chunk>, CoreError> {
        let mut id_sets: Vec<Vec<ChunkId>> = Vec::with_capacity(query.tags.len());
        for content in &query.tags {
            match self
                .store
                .resolve_tag(&TagRef::Content(content.clone()), false)
                .await
            {
                Ok(tag_chunk) => {
                    id_sets.push(self.backend.chunks_with_tag(tag_chunk.id).await?);
                }
                Err(CoreError::NotFound { .. }) => match query.operator {
                    // An unknown tag empties an intersection and drops out
                    // of a union.
                    TagOperator::And => return Ok(Vec::new()),
                    TagOperator::Or => id_sets.push(Vec::new()),
                },
                Err(err) => return Err(err),
            }
        }

        let mut selected: Vec<ChunkId> = match query.operator {
            TagOperator::Or => {
                let mut all: Vec<ChunkId> = id_sets.into_iter().flatten().collect();
                all.sort();
                all.dedup();
                all
            }
            TagOperator::And => {
                let mut iter = id_sets.into_iter();
                let mut acc = iter.next().unwrap_or_default();
                for set in iter {
                    acc.retain(|id| set.contains(id));
                }
                acc.sort();
                acc
            }
        };
        selected.dedup();

        let mut chunks = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(chunk) = self.store.try_get_chunk(id).await? {
                chunks.push(chunk);
            }
        }
        chunks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(chunks)
    }

    // ── lexical ────────────────────────────────────────────────────────

    pub async fn chunks(&self, query: &ChunkQuery) -> Result<(Vec<Chunk>, usize), CoreError> {
        if query.query.trim().is_empty() {
            return Err(CoreError::validation("query cannot be empty"));
        }
        let started = Instant::now();
        let filter = ChunkFilter {
            content_contains: Some(query.query.clone()),
            page_ref: query.filter.page_id,
            is_template: if query.filter.include_templates {
                None
            } else {
                Some(false)
            },
            limit: Some(query.limit.clamp(1, MAX_CANDIDATES)),
            offset: query.offset,
            ..ChunkFilter::default()
        };
        let result = self.store.list(&filter).await;
        self.perf.record(
            "search.chunks",
            started.elapsed(),
            result.as_ref().map(|(c, _)| c.len()).unwrap_or(0),
            result.is_err(),
        );
        result
    }

    // ── hybrid ─────────────────────────────────────────────────────────

    /// Weighted combination of vector similarity and lexical rank:
    /// `combined = w_s · sim + w_t · text_rank`, with the lexical score
    /// normalized to [0, 1] by rank position.
    pub async fn hybrid(&self, query: &HybridQuery) -> Result<Vec<HybridHit>, CoreError> {
        if query.query.trim().is_empty() {
            return Err(CoreError::validation("query cannot be empty"));
        }
        if query.semantic_weight < 0.0 || query.lexical_weight < 0.0 {
            return Err(CoreError::validation("weights must be non-negative"));
        }
        let started = Instant::now();
        let result = self.hybrid_inner(query).await;
        self.perf.record(
            "search.hybrid",
            started.elapsed(),
            result.as_ref().map(Vec::len).unwrap_or(0),
            result.is_err(),
        );
        result
    }

    async fn hybrid_inner(&self, query: &HybridQuery) -> Result<Vec<HybridHit>, CoreError> {
        let limit = query.limit.clamp(1, MAX_CANDIDATES);
        let candidates = limit.saturating_mul(3).min(MAX_CANDIDATES);

        let semantic_fut = async {
            let vector = self.query_embedding(&query.query).await?;
            self.backend
                .nearest_neighbors(
                    &vector,
                    candidates,
                    &VectorFilter::for_model(self.embedder.model_name()),
                )
                .await
        };
        let lexical_fut = async {
            self.backend
                .scan_chunks(&ChunkFilter {
                    content_contains: Some(query.query.clone()),
                    is_template: Some(false),
                    limit: Some(candidates),
                    ..ChunkFilter::default()
                })
                .await
        };
        let (semantic_hits, lexical_hits) = tokio::join!(semantic_fut, lexical_fut);
        let semantic_hits = semantic_hits?;
        let lexical_hits = lexical_hits?;

        let mut semantic_scores: HashMap<ChunkId, f32> = HashMap::new();
        for hit in semantic_hits {
            semantic_scores.insert(hit.chunk_id, hit.similarity);
        }
        let mut lexical_scores: HashMap<ChunkId, f32> = HashMap::new();
        for (rank, chunk) in lexical_hits.iter().enumerate() {
            lexical_scores.insert(chunk.id, 1.0 / (1.0 + rank as f32));
        }

        let mut ids: Vec<ChunkId> = semantic_scores
            .keys()
            .chain(lexical_scores.keys())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();

        let mut hits = Vec::with_capacity(ids.len());
        for id in ids {
            let semantic_score = semantic_scores.get(&id).copied().unwrap_or(0.0);
            let lexical_score = lexical_scores.get(&id).copied().unwrap_or(0.0);
            let combined_score =
                query.semantic_weight * semantic_score + query.lexical_weight * lexical_score;
            if let Some(chunk) = self.store.try_get_chunk(id).await? {
                hits.push(HybridHit {
                    chunk,
                    semantic_score,
                    lexical_score,
                    combined_score,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}
