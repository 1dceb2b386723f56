//! Refusing to enter dependency cycles.
//!
//! The detector tracks only *currently executing* queries: a map from
//! memo key to an in-flight record holding the direct dependencies seen
//! so far. A dependency edge is rejected when it would make an active
//! query reachable from itself. Completed queries cannot participate —
//! a dependency on an already-memoized key is satisfied from the cache
//! without executing anything, so a "cycle" closed through a cached
//! result is not a cycle in the demand-driven model.

use crate::error::QueryError;
use crate::key::MemoKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::thread::ThreadId;
use std::time::Instant;

struct ActiveQuery {
    /// Thread driving this execution; diagnostic only.
    #[allow(dead_code)]
    thread: ThreadId,
    /// When execution began; diagnostic only.
    #[allow(dead_code)]
    started: Instant,
    /// Direct dependencies recorded so far.
    deps: SmallVec<[MemoKey; 4]>,
}

/// Per-engine registry of in-flight query executions.
#[derive(Default)]
pub struct CycleDetector {
    active: Mutex<FxHashMap<MemoKey, ActiveQuery>>,
}

impl CycleDetector {
    /// An empty detector.
    pub fn new() -> Self {
        CycleDetector::default()
    }

    /// Registers `key` as executing. Fails with [`QueryError::Cycle`] if
    /// it is already in flight (the immediate self-recursion case).
    pub fn start(&self, key: MemoKey) -> Result<(), QueryError> {
        let mut active = self.active.lock();
        if active.contains_key(&key) {
            return Err(QueryError::Cycle(vec![key]));
        }
        active.insert(
            key,
            ActiveQuery {
                thread: std::thread::current().id(),
                started: Instant::now(),
                deps: SmallVec::new(),
            },
        );
        Ok(())
    }

    /// Records that `key` is about to depend on `dep`. Fails when the
    /// edge closes a cycle through the active-query graph; on failure the
    /// edge is not recorded and the error carries the participant path
    /// starting and ending at `key`.
    pub fn add_dependency(&self, key: MemoKey, dep: MemoKey) -> Result<(), QueryError> {
        let mut active = self.active.lock();
        if dep == key {
            return Err(QueryError::Cycle(vec![key, key]));
        }
        if let Some(mut path) = find_path(&active, dep, key) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(key);
            cycle.append(&mut path);
            return Err(QueryError::Cycle(cycle));
        }
        if let Some(entry) = active.get_mut(&key) {
            if !entry.deps.contains(&dep) {
                entry.deps.push(dep);
            }
        }
        Ok(())
    }

    /// Releases the in-flight record for `key`. Idempotent.
    pub fn finish(&self, key: MemoKey) {
        self.active.lock().remove(&key);
    }

    /// Number of queries currently executing.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Depth-first path from `from` to `to` over the active-query edges.
/// Returns the node sequence `[from, ..., to]` when one exists.
fn find_path(
    active: &FxHashMap<MemoKey, ActiveQuery>,
    from: MemoKey,
    to: MemoKey,
) -> Option<Vec<MemoKey>> {
    if from == to {
        return Some(vec![from]);
    }
    let entry = active.get(&from)?;
    for dep in &entry.deps {
        if let Some(mut rest) = find_path(active, *dep, to) {
            let mut path = Vec::with_capacity(rest.len() + 1);
            path.push(from);
            path.append(&mut rest);
            return Some(path);
        }
    }
    None
}
