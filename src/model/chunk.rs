use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

/// Opaque 128-bit chunk identifier, stable for the life of the chunk.
pub type ChunkId = Uuid;

/// Open key/value annotation map. The core enforces no semantics on it,
/// with one exception: the ingest pipeline checkpoints its state under the
/// `status` key of the document root.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

pub fn new_chunk_id() -> ChunkId {
    Uuid::new_v4()
}

/// The central entity: a single addressable unit of content.
///
/// Capability flags (`is_page`, `is_tag`, `is_template`, `is_slot`) are
/// independent booleans rather than a tagged union because one chunk may
/// present several capabilities at once (a page that is also used as a tag).
/// Structural invariants are checked at the store boundary, not by the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<ChunkId>,
    /// Root of the containing document, materialized for O(1) lookup.
    /// `None` exactly when this chunk is itself a root.
    #[serde(default)]
    pub page_ref: Option<ChunkId>,
    #[serde(default)]
    pub is_page: bool,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_slot: bool,
    /// Present on template instances; points at the template prototype.
    #[serde(default)]
    pub template_ref: Option<ChunkId>,
    /// Present on chunks that fill a template slot.
    #[serde(default)]
    pub slot_value: Option<String>,
    /// Must equal the length of the `parent_id` chain to the root.
    #[serde(default)]
    pub indent_level: u32,
    /// Ordering among siblings under the same parent.
    #[serde(default)]
    pub sequence_number: Option<i64>,
    /// Denormalized mirror of the tag index rows whose source is this chunk.
    #[serde(default)]
    pub tags: BTreeSet<ChunkId>,
    #[serde(default)]
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// Builds a fresh chunk from a creation request plus the hierarchy
    /// placement the store resolved. Timestamps are server-assigned here.
    pub fn from_new(
        new: NewChunk,
        page_ref: Option<ChunkId>,
        indent_level: u32,
        sequence_number: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        let is_page = new.parent_id.is_none() && !new.is_template && !new.is_slot;
        Chunk {
            id: new.id.unwrap_or_else(new_chunk_id),
            content: new.content,
            parent_id: new.parent_id,
            page_ref,
            is_page,
            is_tag: new.is_tag,
            is_template: new.is_template,
            is_slot: new.is_slot,
            template_ref: new.template_ref,
            slot_value: new.slot_value,
            indent_level,
            sequence_number,
            tags: BTreeSet::new(),
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recomputes the `is_page` flag from the root-coherence rule.
    pub fn recompute_is_page(&mut self) {
        self.is_page = self.parent_id.is_none() && !self.is_template && !self.is_slot;
    }

    /// Content-bearing chunks carry embeddings; templates, slots, and pure
    /// tag chunks do not. `is_tag` marks purpose-built tag chunks: labeling
    /// an existing content chunk goes through the tag index without setting
    /// the flag, so such chunks keep their embeddings.
    pub fn is_content_bearing(&self) -> bool {
        !self.is_template && !self.is_slot && !self.is_tag
    }
}

/// Client-supplied fields for creating a chunk. Placement fields
/// (`page_ref`, `indent_level`) are resolved by the store, never accepted
/// from the outside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewChunk {
    /// Caller-chosen id makes the create idempotent; omitted means fresh.
    #[serde(default)]
    pub id: Option<ChunkId>,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<ChunkId>,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub is_slot: bool,
    #[serde(default)]
    pub template_ref: Option<ChunkId>,
    #[serde(default)]
    pub slot_value: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl NewChunk {
    pub fn text(content: impl Into<String>) -> Self {
        NewChunk {
            content: content.into(),
            ..NewChunk::default()
        }
    }

    pub fn child_of(content: impl Into<String>, parent: ChunkId) -> Self {
        NewChunk {
            content: content.into(),
            parent_id: Some(parent),
            ..NewChunk::default()
        }
    }

    /// Flag-level validation that needs no storage access: capability
    /// exclusions plus template/slot shape rules. Referential checks run
    /// in the store where the neighbors can be fetched.
    pub fn validate_flags(&self) -> Result<(), CoreError> {
        if self.is_template && self.is_slot {
            return Err(CoreError::validation(
                "a chunk cannot be both a template and a slot",
            ));
        }
        if self.is_tag && (self.is_template || self.is_slot) {
            return Err(CoreError::validation(
                "a tag chunk cannot also be a template or slot",
            ));
        }
        if self.slot_value.is_some() && !self.is_slot {
            return Err(CoreError::validation(
                "slot_value is only valid on slot chunks",
            ));
        }
        if self.is_slot && self.parent_id.is_none() {
            return Err(CoreError::validation("a slot must live under a parent"));
        }
        Ok(())
    }
}

/// Partial update applied to an existing chunk. Structural moves go through
/// the dedicated move operation, not through a patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPatch {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub slot_value: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<i64>,
    /// Keys present here are merged over the existing metadata map; a JSON
    /// `null` value deletes the key.
    #[serde(default)]
    pub metadata: Option<JsonMap>,
}

impl ChunkPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.slot_value.is_none()
            && self.sequence_number.is_none()
            && self.metadata.is_none()
    }

    /// Applies this patch in place and bumps `updated_at`.
    pub fn apply_to(&self, chunk: &mut Chunk) {
        if let Some(content) = &self.content {
            chunk.content = content.clone();
        }
        if let Some(slot_value) = &self.slot_value {
            chunk.slot_value = Some(slot_value.clone());
        }
        if let Some(seq) = self.sequence_number {
            chunk.sequence_number = Some(seq);
        }
        if let Some(patch_meta) = &self.metadata {
            for (key, value) in patch_meta {
                if value.is_null() {
                    chunk.metadata.remove(key);
                } else {
                    chunk.metadata.insert(key.clone(), value.clone());
                }
            }
        }
        chunk.updated_at = Utc::now();
    }
}
