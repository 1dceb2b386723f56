//! Latency and resource telemetry for the query engine.
//!
//! Each query kind keeps a rolling ring of recent samples; percentiles
//! are computed on demand rather than maintained incrementally. The
//! interactive design target is p95 ≤ 10 ms for hover-class queries on a
//! hot cache, and the numbers this module produces are how that target is
//! watched.

use crate::key::QueryKind;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Samples retained per query kind.
const RING_CAPACITY: usize = 256;

/// One observation of a finished (or aborted) execution.
#[derive(Copy, Clone, Debug)]
pub struct QuerySample {
    /// Wall time the executor spent.
    pub duration: Duration,
    /// Bytes the execution accounted.
    pub bytes: u64,
    /// AST nodes the execution visited.
    pub nodes: u64,
    /// Whether the result came from the memo cache.
    pub cache_hit: bool,
    /// When the sample was taken.
    pub at: SystemTime,
}

/// On-demand summary over one kind's sample ring.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Samples summarized.
    pub count: usize,
    /// Fastest observed execution.
    pub min: Duration,
    /// Slowest observed execution.
    pub max: Duration,
    /// Arithmetic mean.
    pub mean: Duration,
    /// 50th percentile (nearest-rank).
    pub p50: Duration,
    /// 95th percentile (nearest-rank).
    pub p95: Duration,
    /// 99th percentile (nearest-rank).
    pub p99: Duration,
    /// Samples served from cache.
    pub cache_hits: usize,
}

/// Process-wide counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalStats {
    /// Executions observed, hits included.
    pub total_queries: u64,
    /// Executions served from cache.
    pub cache_hits: u64,
    /// Executions aborted on a quota limit.
    pub quota_exceeded: u64,
    /// Running average latency, in microseconds.
    pub avg_latency_us: u64,
    /// Invalidation runs observed.
    pub invalidation_runs: u64,
    /// Queries evicted across all invalidation runs.
    pub queries_invalidated: u64,
}

struct Ring {
    samples: Vec<QuerySample>,
    next: usize,
}

impl Ring {
    fn new() -> Self {
        Ring {
            samples: Vec::with_capacity(RING_CAPACITY),
            next: 0,
        }
    }

    fn push(&mut self, sample: QuerySample) {
        if self.samples.len() < RING_CAPACITY {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % RING_CAPACITY;
    }
}

/// Telemetry sink shared by the executor and the invalidation engine.
#[derive(Default)]
pub struct Telemetry {
    rings: Mutex<FxHashMap<QueryKind, Ring>>,
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    quota_exceeded: AtomicU64,
    latency_total_us: AtomicU64,
    invalidation_runs: AtomicU64,
    queries_invalidated: AtomicU64,
}

impl Telemetry {
    /// A sink with empty rings and zeroed counters.
    pub fn new() -> Self {
        Telemetry::default()
    }

    /// Records one execution sample.
    pub fn record_sample(&self, kind: QueryKind, sample: QuerySample) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if sample.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_total_us
            .fetch_add(sample.duration.as_micros() as u64, Ordering::Relaxed);
        let mut rings = self.rings.lock();
        rings.entry(kind).or_insert_with(Ring::new).push(sample);
    }

    /// Counts one quota-aborted execution.
    pub fn record_quota_exceeded(&self) {
        self.quota_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds one invalidation run into the counters.
    pub fn record_invalidation(&self, queries_invalidated: u64) {
        self.invalidation_runs.fetch_add(1, Ordering::Relaxed);
        self.queries_invalidated
            .fetch_add(queries_invalidated, Ordering::Relaxed);
    }

    /// Summarizes the ring for `kind`. `None` when no sample exists.
    pub fn stats_for(&self, kind: QueryKind) -> Option<QueryStats> {
        let rings = self.rings.lock();
        let ring = rings.get(&kind)?;
        if ring.samples.is_empty() {
            return None;
        }

        let mut durations: Vec<Duration> =
            ring.samples.iter().map(|sample| sample.duration).collect();
        durations.sort_unstable();

        let count = durations.len();
        let total: Duration = durations.iter().sum();
        Some(QueryStats {
            count,
            min: durations[0],
            max: durations[count - 1],
            mean: total / count as u32,
            p50: percentile(&durations, 50),
            p95: percentile(&durations, 95),
            p99: percentile(&durations, 99),
            cache_hits: ring.samples.iter().filter(|sample| sample.cache_hit).count(),
        })
    }

    /// Snapshot of the process-wide counters.
    pub fn global(&self) -> GlobalStats {
        let total = self.total_queries.load(Ordering::Relaxed);
        let latency_total = self.latency_total_us.load(Ordering::Relaxed);
        GlobalStats {
            total_queries: total,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            quota_exceeded: self.quota_exceeded.load(Ordering::Relaxed),
            avg_latency_us: if total == 0 { 0 } else { latency_total / total },
            invalidation_runs: self.invalidation_runs.load(Ordering::Relaxed),
            queries_invalidated: self.queries_invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    debug_assert!(!sorted.is_empty());
    let rank = (sorted.len() * pct).div_ceil(100);
    sorted[rank.saturating_sub(1)]
}
