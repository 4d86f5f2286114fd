//! Template prototypes, slots, and instantiation.

use std::collections::HashMap;

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, ChunkPatch, NewChunk};
use crate::storage::ChunkFilter;

use super::{ChunkStore, sort_siblings};

impl ChunkStore {
    /// Creates a template prototype with one slot child per slot name.
    pub async fn create_template(
        &self,
        name: &str,
        slot_names: &[String],
    ) -> Result<(Chunk, Vec<Chunk>), CoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("template_name cannot be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for slot in slot_names {
            if slot.trim().is_empty() {
                return Err(CoreError::validation("slot names cannot be empty"));
            }
            if !seen.insert(slot.as_str()) {
                return Err(CoreError::validation_with(
                    format!("duplicate slot name '{slot}'"),
                    serde_json::json!({ "slot_name": slot }),
                ));
            }
        }

        let template = self
            .create_chunk(NewChunk {
                is_template: true,
                ..NewChunk::text(name)
            })
            .await?;

        let mut slots = Vec::with_capacity(slot_names.len());
        for (position, slot_name) in slot_names.iter().enumerate() {
            let slot = self
                .create_chunk(NewChunk {
                    is_slot: true,
                    parent_id: Some(template.id),
                    sequence_number: Some(position as i64 + 1),
                    ..NewChunk::text(slot_name.trim())
                })
                .await?;
            slots.push(slot);
        }
        Ok((template, slots))
    }

    pub async fn list_templates(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Chunk>, usize), CoreError> {
        self.list(&ChunkFilter {
            is_template: Some(true),
            limit: Some(limit),
            offset,
            ..ChunkFilter::default()
        })
        .await
    }

    /// Fetches a template and its slot children, slots in sequence order.
    pub async fn template_with_slots(
        &self,
        template_id: ChunkId,
    ) -> Result<(Chunk, Vec<Chunk>), CoreError> {
        let template = self.get_chunk(template_id).await?;
        if !template.is_template {
            return Err(CoreError::validation(format!(
                "chunk {template_id} is not a template"
            )));
        }
        let mut slots = self
            .backend()
            .scan_chunks(&ChunkFilter::children_of(template_id))
            .await?;
        slots.retain(|c| c.is_slot);
        sort_siblings(&mut slots);
        Ok((template, slots))
    }

    /// Instantiates a template: a new root chunk carrying `template_ref`,
    /// with one slot-value child per template slot. Missing values yield
    /// the empty string; unknown slot names fail before any write.
    pub async fn instantiate_template(
        &self,
        template_id: ChunkId,
        instance_name: &str,
        slot_values: &HashMap<String, String>,
    ) -> Result<(Chunk, Vec<Chunk>), CoreError> {
        let (template, slots) = self.template_with_slots(template_id).await?;

        for provided in slot_values.keys() {
            if !slots.iter().any(|slot| &slot.content == provided) {
                return Err(CoreError::validation_with(
                    format!("unknown slot name '{provided}'"),
                    serde_json::json!({
                        "slot_name": provided,
                        "known_slots": slots.iter().map(|s| s.content.clone()).collect::<Vec<_>>(),
                    }),
                ));
            }
        }

        let instance = self
            .create_chunk(NewChunk {
                template_ref: Some(template.id),
                ..NewChunk::text(instance_name)
            })
            .await?;

        let mut filled = Vec::with_capacity(slots.len());
        for slot in &slots {
            let value = slot_values
                .get(&slot.content)
                .cloned()
                .unwrap_or_default();
            let child = self
                .create_chunk(NewChunk {
                    is_slot: true,
                    parent_id: Some(instance.id),
                    sequence_number: slot.sequence_number,
                    slot_value: Some(value),
                    ..NewChunk::text(&slot.content)
                })
                .await?;
            filled.push(child);
        }
        Ok((instance, filled))
    }

    /// Updates one slot value on an instance, leaving the others alone.
    pub async fn set_slot_value(
        &self,
        instance_id: ChunkId,
        slot_name: &str,
        value: &str,
    ) -> Result<Chunk, CoreError> {
        let instance = self.get_chunk(instance_id).await?;
        if instance.template_ref.is_none() {
            return Err(CoreError::validation(format!(
                "chunk {instance_id} is not a template instance"
            )));
        }
        let children = self
            .backend()
            .scan_chunks(&ChunkFilter::children_of(instance_id))
            .await?;
        let slot = children
            .into_iter()
            .find(|c| c.is_slot && c.content == slot_name)
            .ok_or_else(|| CoreError::not_found("slot", slot_name))?;

        self.update_chunk(
            slot.id,
            ChunkPatch {
                slot_value: Some(value.to_string()),
                ..ChunkPatch::default()
            },
        )
        .await
    }

    /// Instances of a template.
    pub async fn template_instances(
        &self,
        template_id: ChunkId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Chunk>, usize), CoreError> {
        self.list(&ChunkFilter {
            template_ref: Some(template_id),
            limit: Some(limit),
            offset,
            ..ChunkFilter::default()
        })
        .await
    }

    /// Deletes a template and its slots. Refused while instances exist.
    pub async fn delete_template(&self, template_id: ChunkId) -> Result<(), CoreError> {
        let template = self.get_chunk(template_id).await?;
        if !template.is_template {
            return Err(CoreError::validation(format!(
                "chunk {template_id} is not a template"
            )));
        }
        let instances = self
            .backend()
            .count_chunks(&ChunkFilter {
                template_ref: Some(template_id),
                ..ChunkFilter::default()
            })
            .await?;
        if instances > 0 {
            return Err(CoreError::conflict(format!(
                "template {template_id} still has {instances} instance(s)"
            )));
        }
        self.delete_chunk(template_id).await
    }
}
