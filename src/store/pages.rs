//! Document-level operations: page roots, subtree retrieval, and the
//! nested structure tree.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, ChunkPatch, JsonMap, NewChunk};
use crate::storage::ChunkFilter;

use super::{ChunkStore, sort_siblings};

/// One node of the nested hierarchy tree exchanged over
/// `GET/PUT /texts/{id}/structure`. Nodes without an id are created on PUT;
/// subtree chunks absent from the submitted tree are deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureNode {
    #[serde(default)]
    pub id: Option<ChunkId>,
    pub content: String,
    #[serde(default)]
    pub children: Vec<StructureNode>,
}

impl ChunkStore {
    /// Creates a document root. The title lands in `metadata.title`.
    pub async fn create_page(
        &self,
        content: &str,
        title: Option<&str>,
    ) -> Result<Chunk, CoreError> {
        let mut metadata = JsonMap::new();
        if let Some(title) = title {
            metadata.insert("title".into(), serde_json::json!(title));
        }
        self.create_chunk(NewChunk {
            metadata,
            ..NewChunk::text(content)
        })
        .await
    }

    pub async fn list_pages(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Chunk>, usize), CoreError> {
        self.list(&ChunkFilter {
            is_page: Some(true),
            limit: Some(limit),
            offset,
            ..ChunkFilter::default()
        })
        .await
    }

    /// A page root plus all of its descendant chunks, parents first.
    pub async fn page_with_descendants(
        &self,
        page_id: ChunkId,
    ) -> Result<(Chunk, Vec<Chunk>), CoreError> {
        let page = self.get_chunk(page_id).await?;
        let mut subtree = self.subtree(page_id).await?;
        subtree.retain(|c| c.id != page_id);
        Ok((page, subtree))
    }

    /// Builds the nested structure tree for a page.
    pub async fn structure_of(&self, page_id: ChunkId) -> Result<StructureNode, CoreError> {
        let (page, descendants) = self.page_with_descendants(page_id).await?;
        let mut all = vec![page.clone()];
        all.extend(descendants);
        Ok(build_tree(&page, &all))
    }

    /// Replaces a page's hierarchy with the submitted tree.
    ///
    /// Existing chunks are moved/edited into position, new nodes are
    /// created, and subtree chunks missing from the tree are deleted. The
    /// root's identity is preserved; its content follows the tree's root.
    pub async fn replace_structure(
        &self,
        page_id: ChunkId,
        tree: StructureNode,
    ) -> Result<StructureNode, CoreError> {
        let page = self.get_chunk(page_id).await?;
        if !page.is_page {
            return Err(CoreError::validation(format!(
                "chunk {page_id} is not a page root"
            )));
        }
        if let Some(declared) = tree.id {
            if declared != page_id {
                return Err(CoreError::validation(
                    "structure root id does not match the addressed page",
                ));
            }
        }

        let before = self.subtree(page_id).await?;
        let known: Vec<ChunkId> = before.iter().map(|c| c.id).collect();
        let mut seen: Vec<ChunkId> = vec![page_id];

        if tree.content != page.content {
            self.update_chunk(
                page_id,
                ChunkPatch {
                    content: Some(tree.content.clone()),
                    ..ChunkPatch::default()
                },
            )
            .await?;
        }

        // Depth-first placement off a LIFO stack: (node, parent, 1-based
        // position). Traversal order does not shape the tree — every node
        // carries its absolute position under its parent.
        let mut queue: Vec<(StructureNode, ChunkId, i64)> = tree
            .children
            .into_iter()
            .enumerate()
            .map(|(i, node)| (node, page_id, i as i64 + 1))
            .collect();

        while let Some((node, parent, position)) = queue.pop() {
            let placed_id = match node.id {
                Some(id) => {
                    if !known.contains(&id) {
                        return Err(CoreError::validation_with(
                            format!("chunk {id} does not belong to this document"),
                            serde_json::json!({ "chunk_id": id }),
                        ));
                    }
                    let current = self.get_chunk(id).await?;
                    if current.parent_id != Some(parent)
                        || current.sequence_number != Some(position)
                    {
                        self.move_chunk(id, Some(parent), Some(position)).await?;
                    }
                    if current.content != node.content {
                        self.update_chunk(
                            id,
                            ChunkPatch {
                                content: Some(node.content.clone()),
                                ..ChunkPatch::default()
                            },
                        )
                        .await?;
                    }
                    id
                }
                None => {
                    let created = self
                        .create_chunk(NewChunk {
                            parent_id: Some(parent),
                            sequence_number: Some(position),
                            ..NewChunk::text(&node.content)
                        })
                        .await?;
                    created.id
                }
            };
            seen.push(placed_id);
            for (i, child) in node.children.into_iter().enumerate() {
                queue.push((child, placed_id, i as i64 + 1));
            }
        }

        // Drop everything the new tree no longer mentions, leaves first.
        let mut orphans: Vec<&Chunk> = before
            .iter()
            .filter(|c| !seen.contains(&c.id))
            .collect();
        orphans.sort_by(|a, b| b.indent_level.cmp(&a.indent_level));
        for orphan in orphans {
            // A parent deleted earlier in this loop already cascaded.
            if self.try_get_chunk(orphan.id).await?.is_some() {
                self.delete_chunk(orphan.id).await?;
            }
        }

        self.structure_of(page_id).await
    }
}

fn build_tree(root: &Chunk, all: &[Chunk]) -> StructureNode {
    let mut children: Vec<&Chunk> = all
        .iter()
        .filter(|c| c.parent_id == Some(root.id))
        .collect();
    let mut owned: Vec<Chunk> = children.drain(..).cloned().collect();
    sort_siblings(&mut owned);
    StructureNode {
        id: Some(root.id),
        content: root.content.clone(),
        children: owned.iter().map(|child| build_tree(child, all)).collect(),
    }
}
