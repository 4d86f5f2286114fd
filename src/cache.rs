//! In-process query cache with TTL, bounded size, and coalesced misses.
//!
//! Entries are keyed by `(operation kind, argument fingerprint)` and carry
//! the serialized result plus an invalidation scope: the chunk and page ids
//! the result was derived from. A write to any id in the scope drops the
//! entry. Template and tag-index writes flush the whole cache — coarse, but
//! divergence-proof.
//!
//! Concurrent misses on one key coalesce: the first caller computes, the
//! rest wait and re-read. A cold cache therefore never amplifies load on
//! the storage engine or the embedding service.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheConfig;
use crate::errors::CoreError;
use crate::model::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
}

/// Cache key: operation kind plus a fingerprint of the call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub op: &'static str,
    pub fingerprint: String,
}

impl CacheKey {
    /// Fingerprints any serializable argument bundle. Serialization order
    /// is stable for a given type, so equal arguments produce equal keys.
    pub fn of<A: Serialize>(op: &'static str, args: &A) -> Self {
        let raw = serde_json::to_string(args).unwrap_or_default();
        let mut hash = 0xcbf29ce484222325u64;
        for byte in raw.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        CacheKey {
            op,
            fingerprint: format!("{hash:016x}"),
        }
    }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
    /// Logical clock value of the last read, for LRU.
    last_used: AtomicU64,
    /// Total reads, for LFU.
    uses: AtomicU64,
    /// Chunk/page ids this result was derived from.
    scope: Vec<ChunkId>,
    op: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

pub struct QueryCache {
    enabled: bool,
    max_entries: usize,
    default_ttl: Duration,
    map: RwLock<FxHashMap<CacheKey, Arc<Entry>>>,
    flights: tokio::sync::Mutex<FxHashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    policies: FxHashMap<&'static str, EvictionPolicy>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        QueryCache {
            enabled: config.enabled,
            max_entries: config.max_entries.max(1),
            default_ttl: config.default_ttl,
            map: RwLock::new(FxHashMap::default()),
            flights: tokio::sync::Mutex::new(FxHashMap::default()),
            policies: FxHashMap::default(),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Overrides the eviction policy for one operation kind (LRU default).
    pub fn with_policy(mut self, op: &'static str, policy: EvictionPolicy) -> Self {
        self.policies.insert(op, policy);
        self
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let map = self.map.read();
        let entry = match map.get(key) {
            Some(entry) => entry,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if entry.expires_at <= Instant::now() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_used.store(now, Ordering::Relaxed);
        entry.uses.fetch_add(1, Ordering::Relaxed);
        match serde_json::from_value(entry.value.clone()) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, key: CacheKey, value: &T, scope: Vec<ChunkId>) {
        self.put_with_ttl(key, value, scope, self.default_ttl);
    }

    pub fn put_with_ttl<T: Serialize>(
        &self,
        key: CacheKey,
        value: &T,
        scope: Vec<ChunkId>,
        ttl: Duration,
    ) {
        if !self.enabled {
            return;
        }
        let serialized = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return,
        };
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(Entry {
            value: serialized,
            expires_at: Instant::now() + ttl,
            last_used: AtomicU64::new(now),
            uses: AtomicU64::new(0),
            scope,
            op: key.op,
        });

        let mut map = self.map.write();
        if !map.contains_key(&key) && map.len() >= self.max_entries {
            self.evict_one(&mut map, key.op);
        }
        map.insert(key, entry);
    }

    /// Removes one victim under the policy configured for `op`.
    fn evict_one(&self, map: &mut FxHashMap<CacheKey, Arc<Entry>>, op: &'static str) {
        let policy = self
            .policies
            .get(op)
            .copied()
            .unwrap_or(EvictionPolicy::Lru);
        let victim = map
            .iter()
            .min_by_key(|(_, entry)| match policy {
                EvictionPolicy::Lru => entry.last_used.load(Ordering::Relaxed),
                EvictionPolicy::Lfu => entry.uses.load(Ordering::Relaxed),
            })
            .map(|(key, _)| key.clone());
        if let Some(victim) = victim {
            map.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cached read with singleflight semantics. The compute closure
    /// returns the value together with its invalidation scope.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<T, CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Vec<ChunkId>), CoreError>>,
    {
        if !self.enabled {
            return compute().await.map(|(value, _)| value);
        }
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            Arc::clone(
                flights
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _leader = flight.lock().await;

        // A leader that finished while we queued already filled the entry.
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let result = compute().await;
        if let Ok((value, scope)) = &result {
            self.put(key.clone(), value, scope.clone());
        }

        let mut flights = self.flights.lock().await;
        flights.remove(&key);
        drop(flights);

        result.map(|(value, _)| value)
    }

    /// Drops every entry derived from the given chunk id.
    pub fn invalidate_chunk(&self, id: ChunkId) {
        let mut map = self.map.write();
        map.retain(|_, entry| !entry.scope.contains(&id));
    }

    /// Drops every entry derived from any of the given ids.
    pub fn invalidate_all(&self, ids: &[ChunkId]) {
        if ids.is_empty() {
            return;
        }
        let mut map = self.map.write();
        map.retain(|_, entry| !entry.scope.iter().any(|s| ids.contains(s)));
    }

    pub fn flush(&self) {
        self.map.write().clear();
    }

    /// Removes expired entries. Called by the background sweeper and from
    /// tests.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|_, entry| entry.expires_at > now);
        let removed = before - map.len();
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "cache sweep dropped expired entries");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.map.read().len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Spawns the periodic sweeper. The handle is aborted on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}
