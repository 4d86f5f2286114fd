//! Complete in-process [`StorageBackend`] implementation.
//!
//! Backs local development runs and the integration suites: vectors are
//! compared by true cosine similarity, graph traversal is a breadth-first
//! expansion, and every table lives behind one `parking_lot` lock. Not
//! intended for large corpora.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::model::{
    Chunk, ChunkId, ChunkPatch, ClosureRow, EmbeddingRow, GraphEdge, GraphNode, JournalEntry,
    Subgraph, TagPair,
};

use super::{ChunkFilter, StorageBackend, VectorFilter, VectorHit};

#[derive(Default)]
struct Tables {
    chunks: FxHashMap<ChunkId, Chunk>,
    closure: FxHashMap<(ChunkId, ChunkId), ClosureRow>,
    tags: BTreeSet<TagPair>,
    embeddings: FxHashMap<(ChunkId, String), EmbeddingRow>,
    nodes: FxHashMap<Uuid, GraphNode>,
    edges: FxHashMap<Uuid, GraphEdge>,
    journal: FxHashMap<Uuid, JournalEntry>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    fn matches(chunk: &Chunk, filter: &ChunkFilter) -> bool {
        if let Some(parent) = filter.parent_id {
            if chunk.parent_id != Some(parent) {
                return false;
            }
        }
        if let Some(page) = filter.page_ref {
            if chunk.page_ref != Some(page) {
                return false;
            }
        }
        if let Some(template) = filter.template_ref {
            if chunk.template_ref != Some(template) {
                return false;
            }
        }
        if let Some(is_page) = filter.is_page {
            if chunk.is_page != is_page {
                return false;
            }
        }
        if let Some(is_tag) = filter.is_tag {
            if chunk.is_tag != is_tag {
                return false;
            }
        }
        if let Some(is_template) = filter.is_template {
            if chunk.is_template != is_template {
                return false;
            }
        }
        if let Some(needle) = &filter.content_contains {
            if !chunk
                .content
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(exact) = &filter.content_equals {
            if &chunk.content != exact {
                return false;
            }
        }
        true
    }

    fn filtered(tables: &Tables, filter: &ChunkFilter) -> Vec<Chunk> {
        let mut hits: Vec<&Chunk> = tables
            .chunks
            .values()
            .filter(|c| Self::matches(c, filter))
            .collect();
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        hits.into_iter().cloned().collect()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>, CoreError> {
        Ok(self.tables.read().chunks.get(&id).cloned())
    }

    async fn put_chunk(&self, chunk: &Chunk) -> Result<(), CoreError> {
        self.tables.write().chunks.insert(chunk.id, chunk.clone());
        Ok(())
    }

    async fn patch_chunk(&self, id: ChunkId, patch: &ChunkPatch) -> Result<Chunk, CoreError> {
        let mut tables = self.tables.write();
        let chunk = tables
            .chunks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("chunk", id))?;
        patch.apply_to(chunk);
        Ok(chunk.clone())
    }

    async fn delete_chunk(&self, id: ChunkId) -> Result<bool, CoreError> {
        Ok(self.tables.write().chunks.remove(&id).is_some())
    }

    async fn scan_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>, CoreError> {
        let tables = self.tables.read();
        let mut hits = Self::filtered(&tables, filter);
        let offset = filter.offset.min(hits.len());
        hits.drain(..offset);
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn count_chunks(&self, filter: &ChunkFilter) -> Result<usize, CoreError> {
        let tables = self.tables.read();
        Ok(tables
            .chunks
            .values()
            .filter(|c| Self::matches(c, filter))
            .count())
    }

    async fn closure_of(&self, id: ChunkId) -> Result<Vec<ClosureRow>, CoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<ClosureRow> = tables
            .closure
            .values()
            .filter(|row| row.ancestor_id == id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.descendant_id.cmp(&b.descendant_id)));
        Ok(rows)
    }

    async fn ancestors_of(&self, id: ChunkId) -> Result<Vec<ClosureRow>, CoreError> {
        let tables = self.tables.read();
        let mut rows: Vec<ClosureRow> = tables
            .closure
            .values()
            .filter(|row| row.descendant_id == id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.ancestor_id.cmp(&b.ancestor_id)));
        Ok(rows)
    }

    async fn insert_closure_rows(&self, rows: &[ClosureRow]) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        for row in rows {
            tables
                .closure
                .insert((row.ancestor_id, row.descendant_id), row.clone());
        }
        Ok(())
    }

    async fn delete_closure_rows(&self, pairs: &[(ChunkId, ChunkId)]) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        for pair in pairs {
            tables.closure.remove(pair);
        }
        Ok(())
    }

    async fn delete_closure_for(&self, id: ChunkId) -> Result<(), CoreError> {
        self.tables
            .write()
            .closure
            .retain(|_, row| row.ancestor_id != id && row.descendant_id != id);
        Ok(())
    }

    async fn nearest_neighbors(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, CoreError> {
        let tables = self.tables.read();
        let mut hits: Vec<VectorHit> = tables
            .embeddings
            .values()
            .filter(|row| row.model_name == filter.model_name)
            .filter_map(|row| {
                let chunk = tables.chunks.get(&row.chunk_id)?;
                if filter.exclude_templates && (chunk.is_template || chunk.is_slot) {
                    return None;
                }
                if let Some(page) = filter.page_ref {
                    if chunk.page_ref != Some(page) && chunk.id != page {
                        return None;
                    }
                }
                if let Some(min) = filter.indent_min {
                    if chunk.indent_level < min {
                        return None;
                    }
                }
                if let Some(max) = filter.indent_max {
                    if chunk.indent_level > max {
                        return None;
                    }
                }
                Some(VectorHit {
                    chunk_id: row.chunk_id,
                    similarity: cosine_similarity(vector, &row.vector),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn graph_traverse(
        &self,
        start: &str,
        max_depth: u32,
        relation_filter: &[String],
        limit: usize,
    ) -> Result<Subgraph, CoreError> {
        let tables = self.tables.read();
        let needle = start.to_lowercase();

        let mut frontier: Vec<Uuid> = tables
            .nodes
            .values()
            .filter(|n| n.name.to_lowercase().contains(&needle))
            .map(|n| n.id)
            .collect();
        frontier.sort();

        let mut seen_nodes: BTreeSet<Uuid> = frontier.iter().copied().collect();
        let mut seen_edges: BTreeSet<Uuid> = BTreeSet::new();

        for _ in 0..max_depth {
            if seen_nodes.len() >= limit {
                break;
            }
            let mut next = Vec::new();
            for edge in tables.edges.values() {
                if !relation_filter.is_empty() && !relation_filter.contains(&edge.relationship) {
                    continue;
                }
                let touches_src = frontier.contains(&edge.source_node_id);
                let touches_dst = frontier.contains(&edge.target_node_id);
                if !touches_src && !touches_dst {
                    continue;
                }
                seen_edges.insert(edge.id);
                let other = if touches_src {
                    edge.target_node_id
                } else {
                    edge.source_node_id
                };
                if seen_nodes.insert(other) {
                    next.push(other);
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut nodes: Vec<GraphNode> = seen_nodes
            .iter()
            .filter_map(|id| tables.nodes.get(id).cloned())
            .take(limit)
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        let kept: BTreeSet<Uuid> = nodes.iter().map(|n| n.id).collect();
        let mut edges: Vec<GraphEdge> = seen_edges
            .iter()
            .filter_map(|id| tables.edges.get(id))
            .filter(|e| kept.contains(&e.source_node_id) && kept.contains(&e.target_node_id))
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Subgraph { nodes, edges })
    }

    async fn upsert_graph_node(&self, node: &GraphNode) -> Result<(), CoreError> {
        self.tables.write().nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn upsert_graph_edge(&self, edge: &GraphEdge) -> Result<(), CoreError> {
        self.tables.write().edges.insert(edge.id, edge.clone());
        Ok(())
    }

    async fn nodes_for_chunk(&self, chunk_id: ChunkId) -> Result<Vec<GraphNode>, CoreError> {
        let tables = self.tables.read();
        let mut nodes: Vec<GraphNode> = tables
            .nodes
            .values()
            .filter(|n| n.chunk_id == chunk_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn delete_graph_for_chunk(&self, chunk_id: ChunkId) -> Result<(), CoreError> {
        let mut tables = self.tables.write();
        let gone: BTreeSet<Uuid> = tables
            .nodes
            .values()
            .filter(|n| n.chunk_id == chunk_id)
            .map(|n| n.id)
            .collect();
        tables.nodes.retain(|_, n| n.chunk_id != chunk_id);
        tables
            .edges
            .retain(|_, e| !gone.contains(&e.source_node_id) && !gone.contains(&e.target_node_id));
        Ok(())
    }

    async fn upsert_tag_relation(&self, pair: TagPair) -> Result<(), CoreError> {
        self.tables.write().tags.insert(pair);
        Ok(())
    }

    async fn delete_tag_relation(&self, pair: TagPair) -> Result<(), CoreError> {
        self.tables.write().tags.remove(&pair);
        Ok(())
    }

    async fn tags_of_chunk(&self, id: ChunkId) -> Result<Vec<ChunkId>, CoreError> {
        let tables = self.tables.read();
        Ok(tables
            .tags
            .iter()
            .filter(|p| p.source_chunk_id == id)
            .map(|p| p.tag_chunk_id)
            .collect())
    }

    async fn chunks_with_tag(&self, tag_id: ChunkId) -> Result<Vec<ChunkId>, CoreError> {
        let tables = self.tables.read();
        Ok(tables
            .tags
            .iter()
            .filter(|p| p.tag_chunk_id == tag_id)
            .map(|p| p.source_chunk_id)
            .collect())
    }

    async fn delete_tag_relations_for(&self, id: ChunkId) -> Result<(), CoreError> {
        self.tables
            .write()
            .tags
            .retain(|p| p.source_chunk_id != id && p.tag_chunk_id != id);
        Ok(())
    }

    async fn list_tag_pairs(&self) -> Result<Vec<TagPair>, CoreError> {
        Ok(self.tables.read().tags.iter().copied().collect())
    }

    async fn upsert_embedding(&self, row: &EmbeddingRow) -> Result<(), CoreError> {
        self.tables
            .write()
            .embeddings
            .insert((row.chunk_id, row.model_name.clone()), row.clone());
        Ok(())
    }

    async fn get_embedding(
        &self,
        chunk_id: ChunkId,
        model_name: &str,
    ) -> Result<Option<EmbeddingRow>, CoreError> {
        Ok(self
            .tables
            .read()
            .embeddings
            .get(&(chunk_id, model_name.to_string()))
            .cloned())
    }

    async fn delete_embeddings_for(&self, chunk_id: ChunkId) -> Result<(), CoreError> {
        self.tables
            .write()
            .embeddings
            .retain(|(id, _), _| *id != chunk_id);
        Ok(())
    }

    async fn list_embedding_keys(&self) -> Result<Vec<(ChunkId, String)>, CoreError> {
        let mut keys: Vec<(ChunkId, String)> =
            self.tables.read().embeddings.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn put_journal(&self, entry: &JournalEntry) -> Result<(), CoreError> {
        self.tables.write().journal.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_journal(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.write().journal.remove(&id);
        Ok(())
    }

    async fn list_open_journals(&self) -> Result<Vec<JournalEntry>, CoreError> {
        let mut open: Vec<JournalEntry> = self
            .tables
            .read()
            .journal
            .values()
            .filter(|e| !e.committed)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewChunk;

    fn chunk(content: &str) -> Chunk {
        Chunk::from_new(NewChunk::text(content), None, 0, None)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let backend = MemoryBackend::new();
        let c = chunk("hello");
        backend.put_chunk(&c).await.unwrap();
        assert_eq!(backend.get_chunk(c.id).await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn put_is_idempotent_by_id() {
        let backend = MemoryBackend::new();
        let c = chunk("hello");
        backend.put_chunk(&c).await.unwrap();
        backend.put_chunk(&c).await.unwrap();
        let filter = ChunkFilter::default();
        assert_eq!(backend.count_chunks(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_filters_by_content_substring() {
        let backend = MemoryBackend::new();
        backend.put_chunk(&chunk("alpha beta")).await.unwrap();
        backend.put_chunk(&chunk("gamma")).await.unwrap();
        let filter = ChunkFilter {
            content_contains: Some("BETA".into()),
            ..ChunkFilter::default()
        };
        let hits = backend.scan_chunks(&filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "alpha beta");
    }

    #[tokio::test]
    async fn nearest_neighbors_orders_by_cosine() {
        let backend = MemoryBackend::new();
        let a = chunk("a");
        let b = chunk("b");
        backend.put_chunk(&a).await.unwrap();
        backend.put_chunk(&b).await.unwrap();
        backend
            .upsert_embedding(&EmbeddingRow::new(a.id, "m", vec![1.0, 0.0]))
            .await
            .unwrap();
        backend
            .upsert_embedding(&EmbeddingRow::new(b.id, "m", vec![0.0, 1.0]))
            .await
            .unwrap();

        let hits = backend
            .nearest_neighbors(&[0.9, 0.1], 2, &VectorFilter::for_model("m"))
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, a.id);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[tokio::test]
    async fn graph_traverse_respects_depth() {
        let backend = MemoryBackend::new();
        let c = chunk("doc");
        backend.put_chunk(&c).await.unwrap();

        let mk_node = |name: &str| GraphNode {
            id: Uuid::new_v4(),
            chunk_id: c.id,
            name: name.into(),
            entity_type: "thing".into(),
            properties: Default::default(),
        };
        let n1 = mk_node("ada");
        let n2 = mk_node("babbage");
        let n3 = mk_node("turing");
        for n in [&n1, &n2, &n3] {
            backend.upsert_graph_node(n).await.unwrap();
        }
        let mk_edge = |s: &GraphNode, t: &GraphNode| GraphEdge {
            id: Uuid::new_v4(),
            source_node_id: s.id,
            target_node_id: t.id,
            relationship: "knows".into(),
            properties: Default::default(),
        };
        backend.upsert_graph_edge(&mk_edge(&n1, &n2)).await.unwrap();
        backend.upsert_graph_edge(&mk_edge(&n2, &n3)).await.unwrap();

        let depth1 = backend.graph_traverse("ada", 1, &[], 100).await.unwrap();
        assert_eq!(depth1.nodes.len(), 2);

        let depth2 = backend.graph_traverse("ada", 2, &[], 100).await.unwrap();
        assert_eq!(depth2.nodes.len(), 3);
        assert_eq!(depth2.edges.len(), 2);
    }

    #[tokio::test]
    async fn delete_graph_for_chunk_drops_dangling_edges() {
        let backend = MemoryBackend::new();
        let c1 = chunk("one");
        let c2 = chunk("two");
        let n1 = GraphNode {
            id: Uuid::new_v4(),
            chunk_id: c1.id,
            name: "a".into(),
            entity_type: "t".into(),
            properties: Default::default(),
        };
        let n2 = GraphNode {
            id: Uuid::new_v4(),
            chunk_id: c2.id,
            name: "b".into(),
            entity_type: "t".into(),
            properties: Default::default(),
        };
        backend.upsert_graph_node(&n1).await.unwrap();
        backend.upsert_graph_node(&n2).await.unwrap();
        backend
            .upsert_graph_edge(&GraphEdge {
                id: Uuid::new_v4(),
                source_node_id: n1.id,
                target_node_id: n2.id,
                relationship: "rel".into(),
                properties: Default::default(),
            })
            .await
            .unwrap();

        backend.delete_graph_for_chunk(c1.id).await.unwrap();
        let left = backend.nodes_for_chunk(c2.id).await.unwrap();
        assert_eq!(left.len(), 1);
        let sub = backend.graph_traverse("b", 3, &[], 10).await.unwrap();
        assert!(sub.edges.is_empty());
    }

    #[tokio::test]
    async fn tag_relations_are_unique_pairs() {
        let backend = MemoryBackend::new();
        let c = chunk("content");
        let t = chunk("tag");
        let pair = TagPair {
            source_chunk_id: c.id,
            tag_chunk_id: t.id,
        };
        backend.upsert_tag_relation(pair).await.unwrap();
        backend.upsert_tag_relation(pair).await.unwrap();
        assert_eq!(backend.tags_of_chunk(c.id).await.unwrap(), vec![t.id]);
        assert_eq!(backend.chunks_with_tag(t.id).await.unwrap(), vec![c.id]);
    }
}
