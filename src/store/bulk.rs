//! Journaled bulk writes with compensating rollback.
//!
//! The storage engine offers no multi-row transactions, so a bulk request
//! is a reversible sequence: a journal entry with pre-images precedes the
//! writes, the `committed` flag flips once every member landed, and any
//! failure drives compensation from the journal. A delta that fails
//! validation rolls the whole bulk back and the error names its index.

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, ChunkPatch, JournalOp, NewChunk};

use super::ChunkStore;

/// Reparenting instruction inside a bulk delta. `new_parent_id: None`
/// promotes the chunk to a root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentChange {
    #[serde(default)]
    pub new_parent_id: Option<ChunkId>,
}

/// One per-chunk delta in a bulk update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDelta {
    pub chunk_id: ChunkId,
    #[serde(default)]
    pub content: Option<String>,
    /// Present iff the chunk moves. Absent means no structural change.
    #[serde(default)]
    pub parent: Option<ParentChange>,
    #[serde(default)]
    pub new_sequence: Option<i64>,
    /// Optional cross-check: when present it must equal the indent level
    /// the hierarchy yields after the move.
    #[serde(default)]
    pub new_indent_level: Option<u32>,
}

impl BulkDelta {
    fn is_structural(&self) -> bool {
        self.parent.is_some() || self.new_sequence.is_some()
    }
}

/// What a completed structural delta needs for its reverse move.
struct AppliedMove {
    chunk_id: ChunkId,
    old_parent: Option<ChunkId>,
    old_sequence: Option<i64>,
}

impl ChunkStore {
    /// Creates a batch of chunks. Parents may reference chunks created
    /// earlier in the same batch. Any failure deletes everything the
    /// batch already created.
    pub async fn bulk_create(&self, batch: Vec<NewChunk>) -> Result<Vec<Chunk>, CoreError> {
        for (index, new) in batch.iter().enumerate() {
            new.validate_flags().map_err(|err| at_index(err, index))?;
        }

        let mut journal = crate::model::JournalEntry::new();
        self.backend().put_journal(&journal).await?;

        let mut created: Vec<Chunk> = Vec::with_capacity(batch.len());
        for (index, new) in batch.into_iter().enumerate() {
            match self.create_chunk(new).await {
                Ok(chunk) => {
                    journal.ops.push(JournalOp::Create { chunk_id: chunk.id });
                    self.backend().put_journal(&journal).await?;
                    created.push(chunk);
                }
                Err(err) => {
                    self.rollback_creates(&created).await;
                    self.backend().delete_journal(journal.id).await.ok();
                    return Err(at_index(err, index));
                }
            }
        }

        journal.committed = true;
        self.backend().put_journal(&journal).await?;
        self.backend().delete_journal(journal.id).await?;
        Ok(created)
    }

    async fn rollback_creates(&self, created: &[Chunk]) {
        for chunk in created.iter().rev() {
            if let Err(err) = self.delete_chunk(chunk.id).await {
                tracing::error!(chunk = %chunk.id, error = %err, "bulk rollback failed to delete created chunk");
            }
        }
    }

    /// Applies a batch of deltas: structural changes first, then content.
    /// Either every delta lands or none do.
    pub async fn bulk_update(&self, deltas: Vec<BulkDelta>) -> Result<Vec<Chunk>, CoreError> {
        // Every addressed chunk must exist before anything is written.
        for (index, delta) in deltas.iter().enumerate() {
            self.get_chunk(delta.chunk_id)
                .await
                .map_err(|err| at_index(err, index))?;
        }

        let mut journal = crate::model::JournalEntry::new();
        for delta in &deltas {
            if delta.content.is_some() {
                let pre = self.get_chunk(delta.chunk_id).await?;
                journal.ops.push(JournalOp::Update {
                    pre_image: Box::new(pre),
                });
            }
        }
        self.backend().put_journal(&journal).await?;

        let mut applied_moves: Vec<AppliedMove> = Vec::new();
        let mut content_pre_images: Vec<Chunk> = Vec::new();
        let mut updated: Vec<(usize, Chunk)> = Vec::new();

        let structural: Vec<(usize, &BulkDelta)> = deltas
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_structural())
            .collect();
        let content_only: Vec<(usize, &BulkDelta)> = deltas
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.is_structural() && d.content.is_some())
            .collect();

        let outcome: Result<(), CoreError> = async {
            for (index, delta) in &structural {
                let before = self.get_chunk(delta.chunk_id).await?;
                let target_parent = match &delta.parent {
                    Some(change) => change.new_parent_id,
                    None => before.parent_id,
                };
                let moved = self
                    .move_chunk(delta.chunk_id, target_parent, delta.new_sequence)
                    .await
                    .map_err(|err| at_index(err, *index))?;
                applied_moves.push(AppliedMove {
                    chunk_id: delta.chunk_id,
                    old_parent: before.parent_id,
                    old_sequence: before.sequence_number,
                });
                if let Some(expected) = delta.new_indent_level {
                    if moved.indent_level != expected {
                        return Err(at_index(
                            CoreError::validation_with(
                                format!(
                                    "indent level {expected} does not match hierarchy depth {}",
                                    moved.indent_level
                                ),
                                serde_json::json!({
                                    "expected": expected,
                                    "actual": moved.indent_level,
                                }),
                            ),
                            *index,
                        ));
                    }
                }
                if let Some(content) = &delta.content {
                    content_pre_images.push(moved.clone());
                    let patched = self
                        .update_chunk(
                            delta.chunk_id,
                            ChunkPatch {
                                content: Some(content.clone()),
                                ..ChunkPatch::default()
                            },
                        )
                        .await
                        .map_err(|err| at_index(err, *index))?;
                    updated.push((*index, patched));
                } else {
                    updated.push((*index, moved));
                }
            }

            for (index, delta) in &content_only {
                let before = self.get_chunk(delta.chunk_id).await?;
                content_pre_images.push(before);
                let patched = self
                    .update_chunk(
                        delta.chunk_id,
                        ChunkPatch {
                            content: delta.content.clone(),
                            ..ChunkPatch::default()
                        },
                    )
                    .await
                    .map_err(|err| at_index(err, *index))?;
                updated.push((*index, patched));
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                journal.committed = true;
                self.backend().put_journal(&journal).await?;
                self.backend().delete_journal(journal.id).await?;
                updated.sort_by_key(|(index, _)| *index);
                Ok(updated.into_iter().map(|(_, chunk)| chunk).collect())
            }
            Err(err) => {
                self.rollback_bulk(&applied_moves, &content_pre_images).await;
                self.backend().delete_journal(journal.id).await.ok();
                Err(err)
            }
        }
    }

    async fn rollback_bulk(&self, moves: &[AppliedMove], content_pre_images: &[Chunk]) {
        for pre in content_pre_images.iter().rev() {
            if let Err(err) = self.backend().put_chunk(pre).await {
                tracing::error!(chunk = %pre.id, error = %err, "bulk rollback failed to restore content");
            }
        }
        for applied in moves.iter().rev() {
            if let Err(err) = self
                .move_chunk(applied.chunk_id, applied.old_parent, applied.old_sequence)
                .await
            {
                tracing::error!(chunk = %applied.chunk_id, error = %err, "bulk rollback failed to reverse move");
            }
        }
        self.cache().flush();
    }
}

/// Attaches the offending delta index to an error without demoting its kind.
fn at_index(err: CoreError, index: usize) -> CoreError {
    match err {
        CoreError::Validation { message, details } => {
            let mut details = match details {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            details.insert("index".into(), serde_json::json!(index));
            CoreError::Validation {
                message: format!("delta {index}: {message}"),
                details: serde_json::Value::Object(details),
            }
        }
        CoreError::Conflict { message } => CoreError::Conflict {
            message: format!("delta {index}: {message}"),
        },
        other => other,
    }
}
