//! Data-layer adapter: a typed facade over the storage engine.
//!
//! The [`StorageBackend`] trait is the seam between the core and the engine
//! that actually holds the five tables (chunks, tag index, hierarchy
//! closure, embeddings, graph). Two implementations ship:
//!
//! - [`RestBackend`] — the production adapter over the engine's HTTPS/JSON
//!   surface, with authentication, wire serialization, error translation,
//!   and retry with exponential backoff.
//! - [`MemoryBackend`] — a complete in-process implementation used for
//!   local runs and the integration suites.
//!
//! All mutating operations are idempotent for a given primary key. Writes
//! are single-row; the chunk store composes higher-level atomicity on top.

mod memory;
mod rest;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::model::{
    Chunk, ChunkId, ChunkPatch, ClosureRow, EmbeddingRow, GraphEdge, GraphNode, JournalEntry,
    Subgraph, TagPair,
};

pub use memory::MemoryBackend;
pub use rest::RestBackend;
pub use retry::RetryPolicy;

/// Predicate set for chunk scans. All present fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ChunkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_ref: Option<ChunkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<ChunkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_page: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_tag: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_template: Option<bool>,
    /// Case-insensitive substring match on `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_contains: Option<String>,
    /// Exact match on `content` (tag resolution).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ChunkFilter {
    pub fn pages() -> Self {
        ChunkFilter {
            is_page: Some(true),
            ..ChunkFilter::default()
        }
    }

    pub fn children_of(parent: ChunkId) -> Self {
        ChunkFilter {
            parent_id: Some(parent),
            ..ChunkFilter::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Filter applied inside the engine's nearest-neighbour search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorFilter {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_ref: Option<ChunkId>,
    /// Drop template/slot chunks from the candidate set.
    #[serde(default = "default_true")]
    pub exclude_templates: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indent_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indent_max: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl VectorFilter {
    pub fn for_model(model_name: impl Into<String>) -> Self {
        VectorFilter {
            model_name: model_name.into(),
            page_ref: None,
            exclude_templates: true,
            indent_min: None,
            indent_max: None,
        }
    }
}

/// A nearest-neighbour hit: chunk id plus cosine similarity in [-1, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk_id: ChunkId,
    pub similarity: f32,
}

/// Typed wrapper over the storage engine.
///
/// Every method call authenticates, serializes, and translates engine
/// errors into the core taxonomy. Implementations must keep mutations
/// idempotent by primary key.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ── chunks ─────────────────────────────────────────────────────────

    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>, CoreError>;
    async fn put_chunk(&self, chunk: &Chunk) -> Result<(), CoreError>;
    async fn patch_chunk(&self, id: ChunkId, patch: &ChunkPatch) -> Result<Chunk, CoreError>;
    /// Returns whether a row existed.
    async fn delete_chunk(&self, id: ChunkId) -> Result<bool, CoreError>;
    /// Deterministic order: `(created_at, id)` ascending.
    async fn scan_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, CoreError>;
    async fn count_chunks(&self, filter: &ChunkFilter) -> Result<usize, CoreError>;

    // ── hierarchy closure ──────────────────────────────────────────────

    /// Rows where `ancestor_id == id` (the subtree, self included).
    async fn closure_of(&self, id: ChunkId) -> Result<Vec<ClosureRow>, CoreError>;
    /// Rows where `descendant_id == id` (the ancestor chain, self included).
    async fn ancestors_of(&self, id: ChunkId) -> Result<Vec<ClosureRow>, CoreError>;
    async fn insert_closure_rows(&self, rows: &[ClosureRow]) -> Result<(), CoreError>;
    /// Deletes by `(ancestor_id, descendant_id)` pair.
    async fn delete_closure_rows(&self, pairs: &[(ChunkId, ChunkId)]) -> Result<(), CoreError>;
    /// Deletes every row touching `id` on either side.
    async fn delete_closure_for(&self, id: ChunkId) -> Result<(), CoreError>;

    // ── vector index ───────────────────────────────────────────────────

    /// Hits ordered by cosine similarity descending; ties by chunk id.
    async fn nearest_neighbors(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, CoreError>;

    // ── knowledge graph ────────────────────────────────────────────────

    async fn graph_traverse(
        &self,
        start: &str,
        max_depth: u32,
        relation_filter: &[String],
        limit: usize,
    ) -> Result<Subgraph, CoreError>;
    async fn upsert_graph_node(&self, node: &GraphNode) -> Result<(), CoreError>;
    async fn upsert_graph_edge(&self, edge: &GraphEdge) -> Result<(), CoreError>;
    async fn nodes_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GraphNode>, CoreError>;
    /// Removes the chunk's nodes and every edge touching them.
    async fn delete_graph_for_chunk(&self, chunk_id: ChunkId) -> Result<(), CoreError>;

    // ── tag index ──────────────────────────────────────────────────────

    async fn upsert_tag_relation(&self, pair: TagPair) -> Result<(), CoreError>;
    async fn delete_tag_relation(&self, pair: TagPair) -> Result<(), CoreError>;
    async fn tags_of_chunk(&self, id: ChunkId) -> Result<Vec<ChunkId>, CoreError>;
    async fn chunks_with_tag(&self, tag_id: ChunkId) -> Result<Vec<ChunkId>, CoreError>;
    /// Removes pairs where `id` appears on either side.
    async fn delete_tag_relations_for(&self, id: ChunkId) -> Result<(), CoreError>;
    async fn list_tag_pairs(&self) -> Result<Vec<TagPair>, CoreError>;

    // ── embeddings ─────────────────────────────────────────────────────

    async fn upsert_embedding(&self, row: &EmbeddingRow) -> Result<(), CoreError>;
    async fn get_embedding(
        &self,
        chunk_id: ChunkId,
        model_name: &str,
    ) -> Result<Option<EmbeddingRow>, CoreError>;
    async fn delete_embeddings_for(&self, chunk_id: ChunkId) -> Result<(), CoreError>;
    async fn list_embedding_keys(&self) -> Result<Vec<(ChunkId, String)>, CoreError>;

    // ── write journal ──────────────────────────────────────────────────

    async fn put_journal(&self, entry: &JournalEntry) -> Result<(), CoreError>;
    async fn delete_journal(&self, id: Uuid) -> Result<(), CoreError>;
    async fn list_open_journals(&self) -> Result<Vec<JournalEntry>, CoreError>;

    // ── health ─────────────────────────────────────────────────────────

    async fn ping(&self) -> Result<(), CoreError>;
}
