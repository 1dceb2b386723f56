//! Dependency capture and the reverse-indexed dependency graph.
//!
//! During execution every query owns a frame on a [`DependencyTracker`];
//! AST reads and sub-queries land in the innermost frame without the query
//! body knowing it is being observed. When a query completes, its captured
//! [`DepSet`] is stored in the graph: one forward index (query → deps) and
//! two reverse indices (CID → dependent queries, query → dependent
//! queries) that the invalidation engine walks.

use crate::key::{ContentId, MemoKey};
use log::debug;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::BuildHasherDefault;

pub(crate) type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<FxHasher>>;

/// The finite set of dependencies one query execution observed.
///
/// Insertion order is preserved and duplicates are suppressed at insert,
/// so traversals over a set are deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DepSet {
    cids: FxIndexSet<ContentId>,
    queries: FxIndexSet<MemoKey>,
}

impl DepSet {
    /// An empty set.
    pub fn new() -> Self {
        DepSet::default()
    }

    /// Records a content dependency. Duplicates are suppressed.
    pub fn record_cid(&mut self, cid: ContentId) {
        self.cids.insert(cid);
    }

    /// Records a query dependency. Duplicates are suppressed.
    pub fn record_query(&mut self, key: MemoKey) {
        self.queries.insert(key);
    }

    /// Content dependencies, in first-observation order.
    pub fn cids(&self) -> impl Iterator<Item = &ContentId> {
        self.cids.iter()
    }

    /// Query dependencies, in first-observation order.
    pub fn queries(&self) -> impl Iterator<Item = &MemoKey> {
        self.queries.iter()
    }

    /// True when nothing was observed.
    pub fn is_empty(&self) -> bool {
        self.cids.is_empty() && self.queries.is_empty()
    }

    /// Whether `cid` was observed.
    pub fn contains_cid(&self, cid: &ContentId) -> bool {
        self.cids.contains(cid)
    }

    /// Whether `key` was observed.
    pub fn contains_query(&self, key: &MemoKey) -> bool {
        self.queries.contains(key)
    }

    /// Number of observed dependencies of both flavors.
    pub fn len(&self) -> usize {
        self.cids.len() + self.queries.len()
    }
}

/// Stack of in-flight dependency sets.
///
/// Nested queries capture into their own frame; the parent records a
/// query-dep on the child's memo key at the call site, not by merging the
/// child's frame. Records while no frame is active are no-ops, which is
/// what lets untracked host code call through the same context.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    frames: Vec<DepSet>,
}

impl DependencyTracker {
    /// A tracker with no active frame.
    pub fn new() -> Self {
        DependencyTracker::default()
    }

    /// Pushes a fresh capture frame.
    pub fn start_tracking(&mut self) {
        self.frames.push(DepSet::new());
    }

    /// Pops the innermost frame, returning what it captured.
    pub fn stop_tracking(&mut self) -> Option<DepSet> {
        self.frames.pop()
    }

    /// Appends a content dependency to the innermost frame, if any.
    pub fn record_cid(&mut self, cid: ContentId) {
        if let Some(frame) = self.frames.last_mut() {
            frame.record_cid(cid);
        }
    }

    /// Appends a query dependency to the innermost frame, if any.
    pub fn record_query(&mut self, key: MemoKey) {
        if let Some(frame) = self.frames.last_mut() {
            frame.record_query(key);
        }
    }

    /// Number of active frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Default)]
struct GraphInner {
    deps: FxHashMap<MemoKey, DepSet>,
    cid_dependents: FxHashMap<ContentId, FxIndexSet<MemoKey>>,
    query_dependents: FxHashMap<MemoKey, FxIndexSet<MemoKey>>,
}

/// Forward and reverse dependency indices for every cached query.
///
/// All three structures live behind one lock: recording happens once per
/// executed query and invalidation is rare, so contention is not worth a
/// finer grain here.
#[derive(Default)]
pub struct DependencyGraph {
    inner: Mutex<GraphInner>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Stores `deps` under `key` and indexes `key` as a dependent of
    /// every CID and query in the set. Duplicate edges are suppressed.
    pub fn record(&self, key: MemoKey, deps: &DepSet) {
        let mut inner = self.inner.lock();
        for cid in deps.cids() {
            inner.cid_dependents.entry(*cid).or_default().insert(key);
        }
        for query in deps.queries() {
            inner.query_dependents.entry(*query).or_default().insert(key);
        }
        inner.deps.insert(key, deps.clone());
    }

    /// Removes `key` from every reverse set it appears in, then drops its
    /// forward entry. Returns whether the query was known.
    pub fn remove(&self, key: MemoKey) -> bool {
        let mut inner = self.inner.lock();
        let deps = match inner.deps.remove(&key) {
            Some(deps) => deps,
            None => return false,
        };
        for cid in deps.cids() {
            if let Some(dependents) = inner.cid_dependents.get_mut(cid) {
                dependents.shift_remove(&key);
                if dependents.is_empty() {
                    inner.cid_dependents.remove(cid);
                }
            }
        }
        for query in deps.queries() {
            if let Some(dependents) = inner.query_dependents.get_mut(query) {
                dependents.shift_remove(&key);
                if dependents.is_empty() {
                    inner.query_dependents.remove(query);
                }
            }
        }
        debug!("dependency graph: removed {:?}", key);
        true
    }

    /// Queries that observed `cid`, in recording order.
    pub fn dependents_of_cid(&self, cid: &ContentId) -> Vec<MemoKey> {
        let inner = self.inner.lock();
        inner
            .cid_dependents
            .get(cid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Queries that invoked `key`, in recording order.
    pub fn dependents_of_query(&self, key: &MemoKey) -> Vec<MemoKey> {
        let inner = self.inner.lock();
        inner
            .query_dependents
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The recorded dependency set of `key`, if any.
    pub fn deps_of(&self, key: &MemoKey) -> Option<DepSet> {
        self.inner.lock().deps.get(key).cloned()
    }

    /// Number of queries with recorded dependencies.
    pub fn len(&self) -> usize {
        self.inner.lock().deps.len()
    }

    /// True when no query has recorded dependencies.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every edge and entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.deps.clear();
        inner.cid_dependents.clear();
        inner.query_dependents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::QueryKind;

    fn key(tag: &[u8]) -> MemoKey {
        MemoKey::compute(QueryKind::Hover, tag)
    }

    fn cid(fill: u8) -> ContentId {
        ContentId([fill; 32])
    }

    #[test]
    fn depset_suppresses_duplicates() {
        let mut deps = DepSet::new();
        deps.record_cid(cid(1));
        deps.record_cid(cid(1));
        deps.record_query(key(b"a"));
        deps.record_query(key(b"a"));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn tracker_frames_nest_independently() {
        let mut tracker = DependencyTracker::new();
        tracker.start_tracking();
        tracker.record_cid(cid(1));

        tracker.start_tracking();
        tracker.record_cid(cid(2));
        let inner = tracker.stop_tracking().unwrap();
        assert!(inner.contains_cid(&cid(2)));
        assert!(!inner.contains_cid(&cid(1)));

        let outer = tracker.stop_tracking().unwrap();
        assert!(outer.contains_cid(&cid(1)));
        assert!(!outer.contains_cid(&cid(2)));
    }

    #[test]
    fn records_without_frame_are_no_ops() {
        let mut tracker = DependencyTracker::new();
        tracker.record_cid(cid(1));
        tracker.record_query(key(b"a"));
        assert_eq!(tracker.depth(), 0);
        assert!(tracker.stop_tracking().is_none());
    }

    #[test]
    fn graph_reverse_indices_answer_dependents() {
        let graph = DependencyGraph::new();
        let (parent, child) = (key(b"parent"), key(b"child"));

        let mut deps = DepSet::new();
        deps.record_cid(cid(1));
        deps.record_query(child);
        graph.record(parent, &deps);

        assert_eq!(graph.dependents_of_cid(&cid(1)), vec![parent]);
        assert_eq!(graph.dependents_of_query(&child), vec![parent]);
        assert_eq!(graph.dependents_of_cid(&cid(9)), Vec::<MemoKey>::new());
    }

    #[test]
    fn graph_remove_erases_reverse_edges() {
        let graph = DependencyGraph::new();
        let (a, b) = (key(b"a"), key(b"b"));

        let mut deps = DepSet::new();
        deps.record_cid(cid(1));
        graph.record(a, &deps);
        graph.record(b, &deps);

        assert!(graph.remove(a));
        assert_eq!(graph.dependents_of_cid(&cid(1)), vec![b]);
        assert!(!graph.remove(a));

        assert!(graph.remove(b));
        assert_eq!(graph.dependents_of_cid(&cid(1)), Vec::<MemoKey>::new());
        assert!(graph.is_empty());
    }
}
