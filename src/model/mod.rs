//! The unified chunk data model and its auxiliary row types.
//!
//! Everything addressable in the system is a [`Chunk`]: pages, paragraphs,
//! tags, templates, and template slots are all the same entity distinguished
//! by capability flags. The auxiliary tables (tag index, hierarchy closure,
//! embeddings, graph nodes/edges) reference chunks by id.

mod chunk;
mod rows;
mod status;

pub use chunk::{Chunk, ChunkId, ChunkPatch, JsonMap, NewChunk, new_chunk_id};
pub use rows::{
    ClosureRow, EmbeddingRow, GraphEdge, GraphNode, JournalEntry, JournalOp, Subgraph, TagPair,
};
pub use status::IngestStatus;

/// Hierarchy depth cap. Inserting or moving past this fails validation.
pub const MAX_HIERARCHY_DEPTH: u32 = 100;
