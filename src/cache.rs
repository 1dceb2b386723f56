//! Sharded associative store of memoized query results.
//!
//! Sixty-four independent shards, each its own lock and map, selected by
//! the low 32 bits of the memo key. Lookups on different shards never
//! block each other; operations on a single key serialize within its
//! shard, which is the happens-before edge the executor relies on: a
//! `put` for key K is visible to every subsequent `get` of K, and a
//! `remove` of K is visible to every subsequent miss.

use crate::codec::QueryResult;
use crate::deps::DepSet;
use crate::key::MemoKey;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

type UpgradableGuard<'a, T> =
    lock_api::RwLockUpgradableReadGuard<'a, parking_lot::RawRwLock, T>;

/// Number of independent shards.
pub const SHARD_COUNT: usize = 64;

/// A memoized result together with the dependencies that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResult {
    /// The query's result variant.
    pub result: QueryResult,
    /// What the execution observed.
    pub deps: DepSet,
}

struct Entry {
    cached: CachedResult,
    access_count: AtomicU64,
    last_access_ns: AtomicU64,
}

#[derive(Default)]
struct Shard {
    map: RwLock<FxHashMap<MemoKey, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Aggregated cache counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Live entries across all shards.
    pub entries: usize,
}

/// The sharded memo cache.
pub struct MemoCache {
    shards: Vec<Shard>,
    epoch: Instant,
}

impl Default for MemoCache {
    fn default() -> Self {
        MemoCache::new()
    }
}

impl MemoCache {
    /// An empty cache with [`SHARD_COUNT`] shards.
    pub fn new() -> Self {
        MemoCache {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
            epoch: Instant::now(),
        }
    }

    #[inline]
    fn shard(&self, key: &MemoKey) -> &Shard {
        &self.shards[key.low_bits() as usize % SHARD_COUNT]
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Looks up `key`, updating access metadata and hit/miss counters.
    pub fn get(&self, key: &MemoKey) -> Option<CachedResult> {
        let shard = self.shard(key);
        let map = shard.map.read();
        match map.get(key) {
            Some(entry) => {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                entry.last_access_ns.store(self.now_ns(), Ordering::Relaxed);
                shard.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.cached.clone())
            }
            None => {
                shard.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces the entry for `key`, resetting its access
    /// metadata. Probes under an upgradable read and upgrades only when
    /// the write is actually needed.
    pub fn put(&self, key: MemoKey, cached: CachedResult) {
        let shard = self.shard(&key);
        let guard = shard.map.upgradable_read();
        if let Some(existing) = guard.get(&key) {
            if existing.cached == cached {
                // Same value recomputed; keep the hot access metadata.
                return;
            }
        }
        let mut map = UpgradableGuard::upgrade(guard);
        map.insert(
            key,
            Entry {
                cached,
                access_count: AtomicU64::new(0),
                last_access_ns: AtomicU64::new(self.now_ns()),
            },
        );
    }

    /// Removes the entry for `key`. Returns whether it existed. A removed
    /// entry never reappears without an explicit `put`.
    pub fn remove(&self, key: &MemoKey) -> bool {
        self.shard(key).map.write().remove(key).is_some()
    }

    /// Whether `key` is currently cached. Does not touch counters.
    pub fn contains(&self, key: &MemoKey) -> bool {
        self.shard(key).map.read().contains_key(key)
    }

    /// Access metadata for `key`: (access count, last-access nanos since
    /// cache creation).
    pub fn access_info(&self, key: &MemoKey) -> Option<(u64, u64)> {
        let shard = self.shard(key);
        let map = shard.map.read();
        map.get(key).map(|entry| {
            (
                entry.access_count.load(Ordering::Relaxed),
                entry.last_access_ns.load(Ordering::Relaxed),
            )
        })
    }

    /// Empties one shard by index.
    pub fn clear_shard(&self, index: usize) {
        self.shards[index % SHARD_COUNT].map.write().clear();
    }

    /// Empties every shard. Counters are preserved.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.map.write().clear();
        }
    }

    /// Live entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.map.read().len()).sum()
    }

    /// True when no shard holds an entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregates per-shard counters. Scans all shards; intended for
    /// telemetry and tests, not hot paths.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            stats.hits += shard.hits.load(Ordering::Relaxed);
            stats.misses += shard.misses.load(Ordering::Relaxed);
            stats.entries += shard.map.read().len();
        }
        stats
    }
}
