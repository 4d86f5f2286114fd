//! Tag operations: the tag index and its denormalized mirror.
//!
//! A tag is itself a chunk; the index holds `(source, tag)` pairs and each
//! source chunk mirrors its tag set in the denormalized `tags` field. Both
//! representations are written in the same logical step here; the
//! consistency monitor repairs any divergence a bug might introduce.

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, NewChunk, TagPair};
use crate::storage::ChunkFilter;

use super::ChunkStore;

/// A tag referenced either by the tag chunk's id or by its content.
/// Content references create the tag chunk on first use.
#[derive(Debug, Clone)]
pub enum TagRef {
    Id(ChunkId),
    Content(String),
}

impl ChunkStore {
    /// Resolves a tag reference to its chunk, creating a fresh root tag
    /// chunk for unseen content.
    pub async fn resolve_tag(&self, tag: &TagRef, create: bool) -> Result<Chunk, CoreError> {
        match tag {
            TagRef::Id(id) => {
                let chunk = self.get_chunk(*id).await?;
                Ok(chunk)
            }
            TagRef::Content(content) => {
                let content = content.trim();
                if content.is_empty() {
                    return Err(CoreError::validation("tag content cannot be empty"));
                }
                let existing = self
                    .backend()
                    .scan_chunks(&ChunkFilter {
                        is_tag: Some(true),
                        content_equals: Some(content.to_string()),
                        limit: Some(1),
                        ..ChunkFilter::default()
                    })
                    .await?;
                if let Some(found) = existing.into_iter().next() {
                    return Ok(found);
                }
                if !create {
                    return Err(CoreError::not_found("tag", content));
                }
                self.create_chunk(NewChunk {
                    is_tag: true,
                    ..NewChunk::text(content)
                })
                .await
            }
        }
    }

    /// Adds a tag to a chunk: index row first, mirror second, in one
    /// logical step under the source chunk's lock.
    pub async fn add_tag(&self, source_id: ChunkId, tag: TagRef) -> Result<Chunk, CoreError> {
        let tag_chunk = self.resolve_tag(&tag, true).await?;
        if tag_chunk.id == source_id {
            return Err(CoreError::validation("a chunk cannot tag itself"));
        }

        let _guard = self.locks.acquire(source_id).await;
        let mut source = self.get_chunk(source_id).await?;

        self.backend()
            .upsert_tag_relation(TagPair {
                source_chunk_id: source_id,
                tag_chunk_id: tag_chunk.id,
            })
            .await?;
        if source.tags.insert(tag_chunk.id) {
            source.updated_at = chrono::Utc::now();
            self.backend().put_chunk(&source).await?;
        }

        // Tag-index writes flush the whole cache: coarse, divergence-proof.
        self.cache().flush();
        Ok(source)
    }

    pub async fn remove_tag(
        &self,
        source_id: ChunkId,
        tag_id: ChunkId,
    ) -> Result<Chunk, CoreError> {
        let _guard = self.locks.acquire(source_id).await;
        let mut source = self.get_chunk(source_id).await?;
        if !source.tags.contains(&tag_id) {
            return Err(CoreError::not_found("tag on chunk", tag_id));
        }

        self.backend()
            .delete_tag_relation(TagPair {
                source_chunk_id: source_id,
                tag_chunk_id: tag_id,
            })
            .await?;
        source.tags.remove(&tag_id);
        source.updated_at = chrono::Utc::now();
        self.backend().put_chunk(&source).await?;

        self.cache().flush();
        Ok(source)
    }

    /// The tag chunks attached to a chunk, resolved to full records.
    pub async fn chunk_tags(&self, source_id: ChunkId) -> Result<Vec<Chunk>, CoreError> {
        let source = self.get_chunk(source_id).await?;
        let mut tags = Vec::with_capacity(source.tags.len());
        for tag_id in &source.tags {
            if let Some(tag) = self.try_get_chunk(*tag_id).await? {
                tags.push(tag);
            }
        }
        Ok(tags)
    }
}
