//! Per-chunk-id write serialization.
//!
//! The store holds an id-keyed mutex across each validate-and-write
//! critical section, giving a total order of writes per chunk id. Multi-id
//! operations acquire locks in sorted id order, which rules out deadlock
//! between concurrent structural edits.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ChunkId;

#[derive(Default)]
pub(crate) struct LockRegistry {
    inner: Mutex<FxHashMap<ChunkId, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub(crate) fn new() -> Self {
        LockRegistry::default()
    }

    pub(crate) async fn acquire(&self, id: ChunkId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(id).or_default())
        };
        slot.lock_owned().await
    }

    /// Locks several ids at once, always in ascending id order.
    pub(crate) async fn acquire_many(&self, ids: &[ChunkId]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<ChunkId> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.acquire(id).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::new_chunk_id;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_serializes() {
        let registry = Arc::new(LockRegistry::new());
        let id = new_chunk_id();
        let in_section = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let in_section = Arc::clone(&in_section);
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire(id).await;
                let concurrent = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(concurrent, 0, "critical section was entered concurrently");
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn acquire_many_tolerates_duplicate_ids() {
        let registry = LockRegistry::new();
        let id = new_chunk_id();
        let guards = registry.acquire_many(&[id, id]).await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_block_each_other() {
        let registry = Arc::new(LockRegistry::new());
        let a = new_chunk_id();
        let b = new_chunk_id();

        let _held = registry.acquire(a).await;
        let registry2 = Arc::clone(&registry);
        let acquired = tokio::time::timeout(Duration::from_millis(100), async move {
            registry2.acquire(b).await
        })
        .await;
        assert!(acquired.is_ok());
    }
}
