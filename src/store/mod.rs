//! Chunk store service: the invariant-enforcing layer.
//!
//! Exclusively owns writes to the chunks table and its hierarchy closure.
//! Every operation validates against the data-model invariants before any
//! write, writes in the order chunk → closure → tag mirror → embedding
//! references, and holds an id-keyed mutex across the validate-and-write
//! critical section so writes to one chunk id are totally ordered.

mod bulk;
mod hierarchy;
mod locks;
mod pages;
mod tags;
mod templates;

pub use bulk::{BulkDelta, ParentChange};
pub use pages::StructureNode;
pub use tags::TagRef;

use std::sync::Arc;
use std::time::Instant;

use crate::cache::QueryCache;
use crate::errors::CoreError;
use crate::model::{
    Chunk, ChunkId, ChunkPatch, ClosureRow, JournalEntry, JournalOp, NewChunk,
};
use crate::monitor::PerfMonitor;
use crate::storage::{ChunkFilter, StorageBackend};

use locks::LockRegistry;

pub struct ChunkStore {
    backend: Arc<dyn StorageBackend>,
    cache: Arc<QueryCache>,
    perf: Arc<PerfMonitor>,
    locks: LockRegistry,
}

impl ChunkStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        cache: Arc<QueryCache>,
        perf: Arc<PerfMonitor>,
    ) -> Self {
        ChunkStore {
            backend,
            cache,
            perf,
            locks: LockRegistry::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub(crate) fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    // ── reads ──────────────────────────────────────────────────────────

    pub async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, CoreError> {
        let key = crate::cache::CacheKey::of("chunk_get", &id);
        if let Some(chunk) = self.cache.get::<Chunk>(&key) {
            return Ok(chunk);
        }
        let started = Instant::now();
        let result = self.backend.get_chunk(id).await;
        self.perf
            .record("store.get_chunk", started.elapsed(), 1, result.is_err());
        let chunk = result?.ok_or_else(|| CoreError::not_found("chunk", id))?;
        let mut scope = vec![chunk.id];
        scope.extend(chunk.page_ref);
        self.cache.put(key, &chunk, scope);
        Ok(chunk)
    }

    pub async fn try_get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>, CoreError> {
        self.backend.get_chunk(id).await
    }

    /// Children ordered by sequence number, then id.
    pub async fn children(&self, parent: ChunkId) -> Result<Vec<Chunk>, CoreError> {
        // Existence check keeps 404 semantics for navigation endpoints.
        self.get_chunk(parent).await?;
        let mut children = self
            .backend
            .scan_chunks(&ChunkFilter::children_of(parent))
            .await?;
        sort_siblings(&mut children);
        Ok(children)
    }

    /// Sibling chunks (same parent), excluding the chunk itself.
    pub async fn siblings(&self, id: ChunkId) -> Result<Vec<Chunk>, CoreError> {
        let chunk = self.get_chunk(id).await?;
        let parent = match chunk.parent_id {
            Some(parent) => parent,
            None => return Ok(Vec::new()),
        };
        let mut siblings = self
            .backend
            .scan_chunks(&ChunkFilter::children_of(parent))
            .await?;
        siblings.retain(|c| c.id != id);
        sort_siblings(&mut siblings);
        Ok(siblings)
    }

    /// The ancestor chain from the root down to (and including) the chunk.
    pub async fn ancestor_chain(&self, id: ChunkId) -> Result<Vec<Chunk>, CoreError> {
        self.get_chunk(id).await?;
        let mut rows = self.backend.ancestors_of(id).await?;
        // Deepest ancestor first ⇒ sort by depth descending = root first.
        rows.sort_by(|a, b| b.depth.cmp(&a.depth));
        let mut chain = Vec::with_capacity(rows.len());
        for row in rows {
            chain.push(self.get_chunk(row.ancestor_id).await?);
        }
        Ok(chain)
    }

    /// The whole subtree rooted at `id`, parents before children.
    pub async fn subtree(&self, id: ChunkId) -> Result<Vec<Chunk>, CoreError> {
        let rows = self.backend.closure_of(id).await?;
        if rows.is_empty() {
            // No closure rows at all means the chunk does not exist.
            self.get_chunk(id).await?;
        }
        let mut chunks = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(chunk) = self.backend.get_chunk(row.descendant_id).await? {
                chunks.push(chunk);
            }
        }
        Ok(hierarchy::topological(&rows, chunks))
    }

    pub async fn list(
        &self,
        filter: &ChunkFilter,
    ) -> Result<(Vec<Chunk>, usize), CoreError> {
        let started = Instant::now();
        let total = self.backend.count_chunks(&without_paging(filter)).await?;
        let chunks = self.backend.scan_chunks(filter).await?;
        self.perf
            .record("store.scan", started.elapsed(), chunks.len(), false);
        Ok((chunks, total))
    }

    // ── writes ─────────────────────────────────────────────────────────

    /// Creates one chunk, resolving its hierarchy placement and keeping
    /// the closure synchronized.
    pub async fn create_chunk(&self, new: NewChunk) -> Result<Chunk, CoreError> {
        let started = Instant::now();
        let result = self.create_chunk_inner(new).await;
        self.perf
            .record("store.create_chunk", started.elapsed(), 1, result.is_err());
        result
    }

    async fn create_chunk_inner(&self, new: NewChunk) -> Result<Chunk, CoreError> {
        new.validate_flags()?;

        if let Some(id) = new.id {
            if self.backend.get_chunk(id).await?.is_some() {
                return Err(CoreError::conflict(format!("chunk {id} already exists")));
            }
        }
        if let Some(template_ref) = new.template_ref {
            let template = self
                .backend
                .get_chunk(template_ref)
                .await?
                .ok_or_else(|| CoreError::validation("template_ref resolves to no chunk"))?;
            if !template.is_template {
                return Err(CoreError::validation(
                    "template_ref must point at a template chunk",
                ));
            }
        }

        let (parent, parent_ancestry) = match new.parent_id {
            None => (None, Vec::new()),
            Some(parent_id) => {
                let parent = self
                    .backend
                    .get_chunk(parent_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("parent chunk", parent_id))?;
                hierarchy::check_depth(parent.indent_level, 0)?;
                if new.is_slot && !parent.is_template && parent.template_ref.is_none() {
                    return Err(CoreError::validation(
                        "a slot's parent must be a template or a template instance",
                    ));
                }
                let ancestry = self.backend.ancestors_of(parent_id).await?;
                (Some(parent), ancestry)
            }
        };

        let page_ref = parent
            .as_ref()
            .map(|p| p.page_ref.unwrap_or(p.id));
        let indent_level = parent.as_ref().map(|p| p.indent_level + 1).unwrap_or(0);

        let mut lock_ids = vec![];
        if let Some(id) = new.id {
            lock_ids.push(id);
        }
        if let Some(parent) = &parent {
            lock_ids.push(parent.id);
        }
        let _guards = self.locks.acquire_many(&lock_ids).await;

        let sequence = match &parent {
            Some(parent) => Some(self.place_sequence(parent.id, new.sequence_number).await?),
            None => new.sequence_number,
        };

        let chunk = Chunk::from_new(new, page_ref, indent_level, sequence);

        // Write order: chunk row first, closure second. A reader that sees
        // the chunk before its closure sees a leaf, never a dangling edge.
        self.backend.put_chunk(&chunk).await?;
        let closure = hierarchy::rows_for_insert(chunk.id, &parent_ancestry);
        self.backend.insert_closure_rows(&closure).await?;

        self.invalidate_chunk_scope(&chunk);
        Ok(chunk)
    }

    /// Claims a sequence slot under `parent`, shifting later siblings on
    /// collision. Returns the placed sequence number.
    async fn place_sequence(
        &self,
        parent: ChunkId,
        requested: Option<i64>,
    ) -> Result<i64, CoreError> {
        let mut siblings = self
            .backend
            .scan_chunks(&ChunkFilter::children_of(parent))
            .await?;
        sort_siblings(&mut siblings);

        match requested {
            None => Ok(siblings
                .iter()
                .filter_map(|c| c.sequence_number)
                .max()
                .unwrap_or(0)
                + 1),
            Some(requested) => {
                let collides = siblings
                    .iter()
                    .any(|c| c.sequence_number == Some(requested));
                if collides {
                    for sibling in siblings
                        .iter()
                        .filter(|c| c.sequence_number.is_some_and(|s| s >= requested))
                    {
                        let shifted = ChunkPatch {
                            sequence_number: sibling.sequence_number.map(|s| s + 1),
                            ..ChunkPatch::default()
                        };
                        self.backend.patch_chunk(sibling.id, &shifted).await?;
                        self.cache.invalidate_chunk(sibling.id);
                    }
                }
                Ok(requested)
            }
        }
    }

    /// Content/metadata/slot-value edit. Structural moves go through
    /// [`ChunkStore::move_chunk`].
    pub async fn update_chunk(
        &self,
        id: ChunkId,
        patch: ChunkPatch,
    ) -> Result<Chunk, CoreError> {
        if patch.is_empty() {
            return self.get_chunk(id).await;
        }
        let _guard = self.locks.acquire(id).await;
        let started = Instant::now();
        // Existence pre-check keeps NotFound ahead of engine errors.
        self.get_chunk(id).await?;
        let result = self.backend.patch_chunk(id, &patch).await;
        self.perf
            .record("store.update_chunk", started.elapsed(), 1, result.is_err());
        let updated = result?;
        self.invalidate_chunk_scope(&updated);
        Ok(updated)
    }

    /// Deletes a chunk and cascades: descendants, tag index rows on both
    /// sides, closure rows, embeddings, and graph nodes/edges.
    pub async fn delete_chunk(&self, id: ChunkId) -> Result<(), CoreError> {
        let started = Instant::now();
        let result = self.delete_chunk_inner(id).await;
        self.perf
            .record("store.delete_chunk", started.elapsed(), 1, result.is_err());
        result
    }

    async fn delete_chunk_inner(&self, id: ChunkId) -> Result<(), CoreError> {
        let _guard = self.locks.acquire(id).await;
        self.get_chunk(id).await?;

        let rows = self.backend.closure_of(id).await?;
        let mut members: Vec<(u32, ChunkId)> = rows
            .iter()
            .filter(|row| row.ancestor_id == id)
            .map(|row| (row.depth, row.descendant_id))
            .collect();
        // Leaves first, so no reader ever observes an orphaned child.
        members.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, member) in members {
            self.backend.delete_embeddings_for(member).await?;
            self.backend.delete_graph_for_chunk(member).await?;
            self.backend.delete_tag_relations_for(member).await?;
            self.backend.delete_closure_for(member).await?;
            self.backend.delete_chunk(member).await?;
        }

        // Cascades touch the tag index; coarse flush keeps the cache honest.
        self.cache.flush();
        Ok(())
    }

    // ── move ───────────────────────────────────────────────────────────

    /// Moves a chunk (and its subtree) under a new parent at a sequence
    /// position, maintaining the closure, indent levels, and page refs.
    pub async fn move_chunk(
        &self,
        id: ChunkId,
        new_parent_id: Option<ChunkId>,
        new_sequence: Option<i64>,
    ) -> Result<Chunk, CoreError> {
        let started = Instant::now();
        let result = self
            .move_chunk_inner(id, new_parent_id, new_sequence)
            .await;
        self.perf
            .record("store.move_chunk", started.elapsed(), 1, result.is_err());
        result
    }

    async fn move_chunk_inner(
        &self,
        id: ChunkId,
        new_parent_id: Option<ChunkId>,
        new_sequence: Option<i64>,
    ) -> Result<Chunk, CoreError> {
        if new_parent_id == Some(id) {
            return Err(CoreError::conflict("a chunk cannot be its own parent"));
        }
        let chunk = self.get_chunk(id).await?;

        let subtree_rows = self.backend.closure_of(id).await?;
        if let Some(parent_id) = new_parent_id {
            if hierarchy::subtree_contains(&subtree_rows, parent_id) {
                return Err(CoreError::conflict(
                    "cannot move a chunk under its own descendant",
                ));
            }
        }

        let new_parent = match new_parent_id {
            None => None,
            Some(parent_id) => Some(
                self.backend
                    .get_chunk(parent_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("parent chunk", parent_id))?,
            ),
        };
        let height = hierarchy::subtree_height(&subtree_rows);
        if let Some(parent) = &new_parent {
            hierarchy::check_depth(parent.indent_level, height)?;
        }

        let mut lock_ids = vec![id];
        if let Some(old_parent) = chunk.parent_id {
            lock_ids.push(old_parent);
        }
        if let Some(parent) = &new_parent {
            lock_ids.push(parent.id);
        }
        let _guards = self.locks.acquire_many(&lock_ids).await;

        // Journal the pre-images of every chunk the move touches so a
        // mid-flight failure can be compensated.
        let mut subtree_chunks = Vec::with_capacity(subtree_rows.len());
        for row in &subtree_rows {
            if let Some(member) = self.backend.get_chunk(row.descendant_id).await? {
                subtree_chunks.push(member);
            }
        }
        let mut journal = JournalEntry::new();
        for member in &subtree_chunks {
            journal.ops.push(JournalOp::Update {
                pre_image: Box::new(member.clone()),
            });
        }
        self.backend.put_journal(&journal).await?;

        let outcome = self
            .apply_move(&chunk, &new_parent, new_sequence, &subtree_rows, &subtree_chunks)
            .await;

        match outcome {
            Ok(moved) => {
                self.backend.delete_journal(journal.id).await?;
                let mut stale: Vec<ChunkId> =
                    subtree_chunks.iter().map(|c| c.id).collect();
                stale.extend(chunk.page_ref);
                stale.extend(moved.page_ref);
                self.cache.invalidate_all(&stale);
                Ok(moved)
            }
            Err(err) => {
                self.rollback_move(&journal, &subtree_chunks).await;
                self.backend.delete_journal(journal.id).await.ok();
                Err(err)
            }
        }
    }

    async fn apply_move(
        &self,
        chunk: &Chunk,
        new_parent: &Option<Chunk>,
        new_sequence: Option<i64>,
        subtree_rows: &[ClosureRow],
        subtree_chunks: &[Chunk],
    ) -> Result<Chunk, CoreError> {
        let old_ancestry = self.backend.ancestors_of(chunk.id).await?;

        // Closure surgery: drop the cross-boundary rows, insert the new
        // Cartesian product of ancestors(P') × subtree(C).
        let stale = hierarchy::boundary_pairs(chunk.id, &old_ancestry, subtree_rows);
        self.backend.delete_closure_rows(&stale).await?;
        if let Some(parent) = new_parent {
            let new_ancestry = self.backend.ancestors_of(parent.id).await?;
            let fresh = hierarchy::rows_for_move(&new_ancestry, subtree_rows);
            debug_assert!(hierarchy::closure_is_consistent(&fresh));
            self.backend.insert_closure_rows(&fresh).await?;
        }

        let new_indent = new_parent
            .as_ref()
            .map(|p| p.indent_level + 1)
            .unwrap_or(0);
        let new_page = match new_parent {
            Some(parent) => Some(parent.page_ref.unwrap_or(parent.id)),
            None => None,
        };
        let sequence = match new_parent {
            Some(parent) => Some(self.place_sequence(parent.id, new_sequence).await?),
            None => new_sequence,
        };

        // The depth delta is constant across the subtree.
        let delta = new_indent as i64 - chunk.indent_level as i64;

        let mut moved_root = None;
        for member in subtree_chunks {
            let mut updated = member.clone();
            updated.indent_level = (member.indent_level as i64 + delta) as u32;
            if member.id == chunk.id {
                updated.parent_id = new_parent.as_ref().map(|p| p.id);
                updated.page_ref = new_page;
                updated.sequence_number = sequence;
                updated.recompute_is_page();
            } else {
                // Descendants of a newly promoted root hang off that root.
                updated.page_ref = new_page.or(Some(chunk.id));
            }
            updated.updated_at = chrono::Utc::now();
            self.backend.put_chunk(&updated).await?;
            if member.id == chunk.id {
                moved_root = Some(updated);
            }
        }

        moved_root.ok_or_else(|| {
            CoreError::invariant("moved chunk disappeared from its own subtree")
        })
    }

    /// Compensating rollback for a failed move: restore chunk pre-images
    /// and rebuild their closure from the restored parent pointers.
    async fn rollback_move(&self, journal: &JournalEntry, subtree_chunks: &[Chunk]) {
        for op in &journal.ops {
            if let JournalOp::Update { pre_image } = op {
                if let Err(err) = self.backend.put_chunk(pre_image).await {
                    tracing::error!(chunk = %pre_image.id, error = %err, "move rollback failed to restore chunk");
                }
            }
        }
        for member in subtree_chunks {
            if let Err(err) = self.rebuild_closure_for(member.id).await {
                tracing::error!(chunk = %member.id, error = %err, "move rollback failed to rebuild closure");
            }
        }
        self.cache.flush();
    }

    /// Recomputes the ancestor rows of one chunk by walking its restored
    /// parent chain. Also used by the consistency repair routines.
    pub(crate) async fn rebuild_closure_for(&self, id: ChunkId) -> Result<(), CoreError> {
        let existing = self.backend.ancestors_of(id).await?;
        let pairs: Vec<(ChunkId, ChunkId)> = existing
            .iter()
            .map(|row| (row.ancestor_id, row.descendant_id))
            .collect();
        self.backend.delete_closure_rows(&pairs).await?;

        let mut path = vec![id];
        let mut cursor = id;
        while let Some(chunk) = self.backend.get_chunk(cursor).await? {
            match chunk.parent_id {
                Some(parent) => {
                    if path.contains(&parent) {
                        return Err(CoreError::invariant(format!(
                            "parent cycle detected at chunk {parent}"
                        )));
                    }
                    path.push(parent);
                    cursor = parent;
                }
                None => break,
            }
        }
        path.reverse();

        let mut rows = Vec::with_capacity(path.len());
        for (i, ancestor) in path.iter().enumerate() {
            rows.push(ClosureRow {
                ancestor_id: *ancestor,
                descendant_id: id,
                depth: (path.len() - 1 - i) as u32,
                path: path[i..].to_vec(),
            });
        }
        self.backend.insert_closure_rows(&rows).await
    }

    /// Rolls back every journal entry left uncommitted by a crashed
    /// process: creates are deleted, updates and deletes restore their
    /// pre-images. Called once at startup, before any traffic.
    pub async fn recover_journals(&self) -> Result<usize, CoreError> {
        let open = self.backend.list_open_journals().await?;
        let mut rolled_back = 0;
        for entry in open {
            tracing::warn!(journal = %entry.id, ops = entry.ops.len(), "rolling back uncommitted journal");
            for op in entry.ops.iter().rev() {
                match op {
                    JournalOp::Create { chunk_id } => {
                        if self.backend.get_chunk(*chunk_id).await?.is_some() {
                            self.delete_chunk(*chunk_id).await?;
                        }
                    }
                    JournalOp::Update { pre_image } | JournalOp::Delete { pre_image } => {
                        self.backend.put_chunk(pre_image).await?;
                        self.rebuild_closure_for(pre_image.id).await?;
                    }
                }
            }
            self.backend.delete_journal(entry.id).await?;
            rolled_back += 1;
        }
        if rolled_back > 0 {
            self.cache.flush();
        }
        Ok(rolled_back)
    }

    pub(crate) fn invalidate_chunk_scope(&self, chunk: &Chunk) {
        let mut scope = vec![chunk.id];
        scope.extend(chunk.page_ref);
        scope.extend(chunk.parent_id);
        self.cache.invalidate_all(&scope);
    }
}

pub(crate) fn sort_siblings(chunks: &mut [Chunk]) {
    chunks.sort_by(|a, b| {
        match (a.sequence_number, b.sequence_number) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then(a.id.cmp(&b.id))
    });
}

fn without_paging(filter: &ChunkFilter) -> ChunkFilter {
    ChunkFilter {
        limit: None,
        offset: 0,
        ..filter.clone()
    }
}
