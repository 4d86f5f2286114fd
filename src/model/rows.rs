use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::chunk::{ChunkId, JsonMap};

/// One ancestor/descendant pair in the hierarchy closure, including the
/// depth-0 self pair. `path` runs from the ancestor to the descendant and
/// has `depth + 1` elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureRow {
    pub ancestor_id: ChunkId,
    pub descendant_id: ChunkId,
    pub depth: u32,
    pub path: Vec<ChunkId>,
}

impl ClosureRow {
    pub fn self_row(id: ChunkId) -> Self {
        ClosureRow {
            ancestor_id: id,
            descendant_id: id,
            depth: 0,
            path: vec![id],
        }
    }
}

/// One `(source, tag)` pair in the tag index. A tag chunk is any chunk that
/// appears in the `tag_chunk_id` column; there is no dedicated tag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagPair {
    pub source_chunk_id: ChunkId,
    pub tag_chunk_id: ChunkId,
}

/// One embedding per `(chunk_id, model_name)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub chunk_id: ChunkId,
    pub model_name: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRow {
    pub fn new(chunk_id: ChunkId, model_name: impl Into<String>, vector: Vec<f32>) -> Self {
        EmbeddingRow {
            chunk_id,
            model_name: model_name.into(),
            vector,
            created_at: Utc::now(),
        }
    }
}

/// A knowledge-graph node extracted from one chunk. A chunk may spawn
/// several nodes, one per extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub chunk_id: ChunkId,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub relationship: String,
    #[serde(default)]
    pub properties: JsonMap,
}

/// A connected fragment of the knowledge graph, as returned by traversal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// One reversible write inside a journaled bulk operation.
///
/// The pre-image is everything a compensating step needs: `Create` rolls
/// back by deleting, `Update` by restoring the prior chunk, `Delete` by
/// re-inserting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Create {
        chunk_id: ChunkId,
    },
    Update {
        pre_image: Box<super::Chunk>,
    },
    Delete {
        pre_image: Box<super::Chunk>,
    },
}

/// Journal entry written ahead of a bulk write. The `committed` flag flips
/// only after every member write landed; an uncommitted entry found later
/// drives compensating rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub ops: Vec<JournalOp>,
    pub committed: bool,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new() -> Self {
        JournalEntry {
            id: Uuid::new_v4(),
            ops: Vec::new(),
            committed: false,
            created_at: Utc::now(),
        }
    }
}

impl Default for JournalEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::new_chunk_id;

    #[test]
    fn self_row_has_unit_path() {
        let id = new_chunk_id();
        let row = ClosureRow::self_row(id);
        assert_eq!(row.depth, 0);
        assert_eq!(row.path, vec![id]);
        assert_eq!(row.path.len() as u32, row.depth + 1);
    }

    #[test]
    fn journal_entry_starts_uncommitted() {
        let entry = JournalEntry::new();
        assert!(!entry.committed);
        assert!(entry.ops.is_empty());
    }
}
