//! Periodic reconciliation of the denormalized representations.
//!
//! Seven checks cover the referential seams between the chunks table, the
//! tag index, the hierarchy closure, and the embedding rows. The
//! background task only reports; repairs run when explicitly invoked.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::ingest::IngestPipeline;
use crate::model::{Chunk, ChunkId};
use crate::storage::{ChunkFilter, StorageBackend};
use crate::store::ChunkStore;

const SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    OrphanedChunks,
    ParentCycles,
    DanglingTemplateRefs,
    TagMirrorDivergence,
    OrphanedEmbeddings,
    MissingEmbeddings,
    ClosureIntegrity,
}

impl CheckKind {
    pub const ALL: [CheckKind; 7] = [
        CheckKind::OrphanedChunks,
        CheckKind::ParentCycles,
        CheckKind::DanglingTemplateRefs,
        CheckKind::TagMirrorDivergence,
        CheckKind::OrphanedEmbeddings,
        CheckKind::MissingEmbeddings,
        CheckKind::ClosureIntegrity,
    ];

    pub fn severity(self) -> Severity {
        match self {
            CheckKind::OrphanedChunks
            | CheckKind::ParentCycles
            | CheckKind::DanglingTemplateRefs => Severity::Critical,
            CheckKind::TagMirrorDivergence
            | CheckKind::OrphanedEmbeddings
            | CheckKind::ClosureIntegrity => Severity::Warning,
            CheckKind::MissingEmbeddings => Severity::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::OrphanedChunks => "orphaned_chunks",
            CheckKind::ParentCycles => "parent_cycles",
            CheckKind::DanglingTemplateRefs => "dangling_template_refs",
            CheckKind::TagMirrorDivergence => "tag_mirror",
            CheckKind::OrphanedEmbeddings => "orphaned_embeddings",
            CheckKind::MissingEmbeddings => "missing_embeddings",
            CheckKind::ClosureIntegrity => "closure_integrity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        CheckKind::ALL.into_iter().find(|k| k.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub check: &'static str,
    pub severity: Severity,
    pub count: usize,
    /// A bounded sample of offending ids.
    pub samples: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl CheckReport {
    fn new(kind: CheckKind, offenders: Vec<String>) -> Self {
        CheckReport {
            check: kind.as_str(),
            severity: kind.severity(),
            count: offenders.len(),
            samples: offenders.into_iter().take(SAMPLE_LIMIT).collect(),
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub check: &'static str,
    pub repaired: usize,
}

pub struct ConsistencyMonitor {
    backend: Arc<dyn StorageBackend>,
    store: Arc<ChunkStore>,
    pipeline: Arc<IngestPipeline>,
    embedding_model: String,
}

impl ConsistencyMonitor {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        store: Arc<ChunkStore>,
        pipeline: Arc<IngestPipeline>,
        embedding_model: String,
    ) -> Self {
        ConsistencyMonitor {
            backend,
            store,
            pipeline,
            embedding_model,
        }
    }

    pub async fn run_all(&self) -> Result<Vec<CheckReport>, CoreError> {
        let mut reports = Vec::with_capacity(CheckKind::ALL.len());
        for kind in CheckKind::ALL {
            reports.push(self.run_check(kind).await?);
        }
        Ok(reports)
    }

    pub async fn run_check(&self, kind: CheckKind) -> Result<CheckReport, CoreError> {
        let offenders = match kind {
            CheckKind::OrphanedChunks => self.find_orphans().await?,
            CheckKind::ParentCycles => self.find_cycles().await?,
            CheckKind::DanglingTemplateRefs => self.find_dangling_template_refs().await?,
            CheckKind::TagMirrorDivergence => self.find_tag_divergence().await?,
            CheckKind::OrphanedEmbeddings => self.find_orphaned_embeddings().await?,
            CheckKind::MissingEmbeddings => self.find_missing_embeddings().await?,
            CheckKind::ClosureIntegrity => self.find_closure_breaks().await?,
        };
        Ok(CheckReport::new(kind, offenders))
    }

    /// Runs the repair routine for one check. Cycles and closure breaks
    /// have no automated repair.
    pub async fn repair(&self, kind: CheckKind) -> Result<RepairOutcome, CoreError> {
        let repaired = match kind {
            CheckKind::OrphanedChunks => self.repair_orphans().await?,
            CheckKind::DanglingTemplateRefs => self.repair_dangling_template_refs().await?,
            CheckKind::TagMirrorDivergence => self.repair_tag_divergence().await?,
            CheckKind::OrphanedEmbeddings => self.repair_orphaned_embeddings().await?,
            CheckKind::MissingEmbeddings => self.repair_missing_embeddings().await?,
            CheckKind::ParentCycles | CheckKind::ClosureIntegrity => {
                return Err(CoreError::validation(format!(
                    "check '{}' has no automated repair",
                    kind.as_str()
                )));
            }
        };
        tracing::info!(check = kind.as_str(), repaired, "consistency repair finished");
        Ok(RepairOutcome {
            check: kind.as_str(),
            repaired,
        })
    }

    /// Spawns the periodic report-only task.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match monitor.run_all().await {
                    Ok(reports) => {
                        for report in reports.iter().filter(|r| r.count > 0) {
                            match report.severity {
                                Severity::Critical => tracing::error!(
                                    check = report.check,
                                    count = report.count,
                                    samples = ?report.samples,
                                    "consistency check found critical divergence"
                                ),
                                Severity::Warning => tracing::warn!(
                                    check = report.check,
                                    count = report.count,
                                    "consistency check found divergence"
                                ),
                                Severity::Info => tracing::info!(
                                    check = report.check,
                                    count = report.count,
                                    "consistency check found gaps"
                                ),
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "consistency sweep failed");
                    }
                }
            }
        })
    }

    // ── checks ─────────────────────────────────────────────────────────

    async fn all_chunks(&self) -> Result<Vec<Chunk>, CoreError> {
        self.backend.scan_chunks(&ChunkFilter::default()).await
    }

    async fn find_orphans(&self) -> Result<Vec<String>, CoreError> {
        let chunks = self.all_chunks().await?;
        let ids: FxHashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        Ok(chunks
            .iter()
            .filter(|c| c.parent_id.is_some_and(|p| !ids.contains(&p)))
            .map(|c| c.id.to_string())
            .collect())
    }

    async fn find_cycles(&self) -> Result<Vec<String>, CoreError> {
        let chunks = self.all_chunks().await?;
        let parents: FxHashMap<ChunkId, Option<ChunkId>> =
            chunks.iter().map(|c| (c.id, c.parent_id)).collect();

        let mut offenders = Vec::new();
        for chunk in &chunks {
            let mut seen = HashSet::new();
            let mut cursor = chunk.id;
            loop {
                if !seen.insert(cursor) {
                    if cursor == chunk.id {
                        offenders.push(chunk.id.to_string());
                    }
                    break;
                }
                match parents.get(&cursor).copied().flatten() {
                    Some(parent) if parents.contains_key(&parent) => cursor = parent,
                    _ => break,
                }
            }
        }
        Ok(offenders)
    }

    async fn find_dangling_template_refs(&self) -> Result<Vec<String>, CoreError> {
        let chunks = self.all_chunks().await?;
        let ids: FxHashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        Ok(chunks
            .iter()
            .filter(|c| c.template_ref.is_some_and(|t| !ids.contains(&t)))
            .map(|c| c.id.to_string())
            .collect())
    }

    async fn find_tag_divergence(&self) -> Result<Vec<String>, CoreError> {
        let chunks = self.all_chunks().await?;
        let pairs = self.backend.list_tag_pairs().await?;
        let mut index: FxHashMap<ChunkId, FxHashSet<ChunkId>> = FxHashMap::default();
        for pair in pairs {
            index
                .entry(pair.source_chunk_id)
                .or_default()
                .insert(pair.tag_chunk_id);
        }
        Ok(chunks
            .iter()
            .filter(|c| {
                let mirrored: FxHashSet<ChunkId> = c.tags.iter().copied().collect();
                let indexed = index.remove(&c.id).unwrap_or_default();
                mirrored != indexed
            })
            .map(|c| c.id.to_string())
            .collect())
    }

    async fn find_orphaned_embeddings(&self) -> Result<Vec<String>, CoreError> {
        let keys = self.backend.list_embedding_keys().await?;
        let chunks = self.all_chunks().await?;
        let ids: FxHashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        Ok(keys
            .iter()
            .filter(|(chunk_id, _)| !ids.contains(chunk_id))
            .map(|(chunk_id, model)| format!("{chunk_id}:{model}"))
            .collect())
    }

    async fn find_missing_embeddings(&self) -> Result<Vec<String>, CoreError> {
        let keys = self.backend.list_embedding_keys().await?;
        let have: FxHashSet<ChunkId> = keys
            .iter()
            .filter(|(_, model)| model == &self.embedding_model)
            .map(|(chunk_id, _)| *chunk_id)
            .collect();
        let chunks = self.all_chunks().await?;
        Ok(chunks
            .iter()
            .filter(|c| c.is_content_bearing() && !have.contains(&c.id))
            .map(|c| c.id.to_string())
            .collect())
    }

    /// Depth coherence between the chunks table and the closure: each
    /// chunk's ancestor-row count must be `indent_level + 1` and its
    /// self-row must exist.
    async fn find_closure_breaks(&self) -> Result<Vec<String>, CoreError> {
        let chunks = self.all_chunks().await?;
        let mut offenders = Vec::new();
        for chunk in &chunks {
            let ancestors = self.backend.ancestors_of(chunk.id).await?;
            let has_self = ancestors
                .iter()
                .any(|row| row.ancestor_id == chunk.id && row.depth == 0);
            if !has_self || ancestors.len() as u32 != chunk.indent_level + 1 {
                offenders.push(chunk.id.to_string());
            }
        }
        Ok(offenders)
    }

    // ── repairs ────────────────────────────────────────────────────────

    /// Reparents orphans to their recorded page root when it still
    /// exists, otherwise promotes them to roots.
    async fn repair_orphans(&self) -> Result<usize, CoreError> {
        let chunks = self.all_chunks().await?;
        let ids: FxHashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        let mut repaired = 0;

        for chunk in chunks {
            let Some(parent) = chunk.parent_id else {
                continue;
            };
            if ids.contains(&parent) {
                continue;
            }
            let fallback = chunk.page_ref.filter(|page| ids.contains(page));
            let mut fixed = chunk.clone();
            match fallback {
                Some(page) => {
                    fixed.parent_id = Some(page);
                }
                None => {
                    fixed.parent_id = None;
                    fixed.page_ref = None;
                }
            }
            fixed.recompute_is_page();
            self.backend.put_chunk(&fixed).await?;
            self.store.rebuild_closure_for(fixed.id).await?;

            // Depth coherence after the reparent.
            let ancestors = self.backend.ancestors_of(fixed.id).await?;
            fixed.indent_level = ancestors.len().saturating_sub(1) as u32;
            self.backend.put_chunk(&fixed).await?;
            repaired += 1;
        }
        if repaired > 0 {
            self.store.cache().flush();
        }
        Ok(repaired)
    }

    async fn repair_dangling_template_refs(&self) -> Result<usize, CoreError> {
        let chunks = self.all_chunks().await?;
        let ids: FxHashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        let mut repaired = 0;
        for chunk in chunks {
            if chunk.template_ref.is_some_and(|t| !ids.contains(&t)) {
                let mut fixed = chunk;
                fixed.template_ref = None;
                fixed.updated_at = Utc::now();
                self.backend.put_chunk(&fixed).await?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            self.store.cache().flush();
        }
        Ok(repaired)
    }

    /// Rewrites the denormalized `tags` field from the tag index, which is
    /// the authoritative side.
    async fn repair_tag_divergence(&self) -> Result<usize, CoreError> {
        let chunks = self.all_chunks().await?;
        let pairs = self.backend.list_tag_pairs().await?;
        let mut index: FxHashMap<ChunkId, std::collections::BTreeSet<ChunkId>> =
            FxHashMap::default();
        for pair in pairs {
            index
                .entry(pair.source_chunk_id)
                .or_default()
                .insert(pair.tag_chunk_id);
        }

        let mut repaired = 0;
        for chunk in chunks {
            let indexed = index.remove(&chunk.id).unwrap_or_default();
            if chunk.tags != indexed {
                let mut fixed = chunk;
                fixed.tags = indexed;
                fixed.updated_at = Utc::now();
                self.backend.put_chunk(&fixed).await?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            self.store.cache().flush();
        }
        Ok(repaired)
    }

    async fn repair_orphaned_embeddings(&self) -> Result<usize, CoreError> {
        let keys = self.backend.list_embedding_keys().await?;
        let chunks = self.all_chunks().await?;
        let ids: FxHashSet<ChunkId> = chunks.iter().map(|c| c.id).collect();
        let mut repaired = 0;
        let mut seen: FxHashSet<ChunkId> = FxHashSet::default();
        for (chunk_id, _) in keys {
            if !ids.contains(&chunk_id) && seen.insert(chunk_id) {
                self.backend.delete_embeddings_for(chunk_id).await?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    /// Enqueues embedding work for content-bearing chunks with no vector.
    async fn repair_missing_embeddings(&self) -> Result<usize, CoreError> {
        let offenders = self.find_missing_embeddings().await?;
        let ids: Vec<ChunkId> = offenders
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect();
        self.pipeline.embed_chunks(&ids).await
    }
}
