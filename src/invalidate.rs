//! Precise invalidation over the reverse dependency indices.
//!
//! A change-set names the CIDs that were modified or removed. The engine
//! computes the transitive closure of dependent queries, evicts each one
//! from the memo cache, and strips its edges from the dependency graph.
//! After a run, no memoized result that transitively observed a changed
//! CID survives, and nothing else is touched.

use crate::cache::MemoCache;
use crate::deps::{DependencyGraph, FxIndexSet};
use crate::key::{ContentId, MemoKey};
use log::debug;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// How disruptive a change-set is.
///
/// `Cosmetic` changes (formatting, comments) never invalidate; that is an
/// invariant, not a configuration. The engine's minimum severity is a
/// knob on top, defaulting to `Minor`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Whitespace/comment-level change; never invalidates.
    Cosmetic,
    /// Local change with possible semantic impact.
    Minor,
    /// Structural change.
    Major,
    /// Interface-breaking change.
    Breaking,
}

/// A set of changed CIDs, partitioned into modified and removed.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    modified: FxIndexSet<ContentId>,
    removed: FxIndexSet<ContentId>,
    severity: Option<Severity>,
}

impl ChangeSet {
    /// An empty change-set with no severity label.
    pub fn new() -> Self {
        ChangeSet::default()
    }

    /// Adds a modified CID. Duplicates are suppressed.
    pub fn modify(mut self, cid: ContentId) -> Self {
        self.modified.insert(cid);
        self
    }

    /// Adds a removed CID. Duplicates are suppressed.
    pub fn remove(mut self, cid: ContentId) -> Self {
        self.removed.insert(cid);
        self
    }

    /// Labels the change-set with a severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// The effective severity: unlabeled change-sets are treated as
    /// `Major` so that an uninformed provider still invalidates.
    pub fn severity(&self) -> Severity {
        self.severity.unwrap_or(Severity::Major)
    }

    /// All changed CIDs, modified first, then removed.
    pub fn cids(&self) -> impl Iterator<Item = &ContentId> {
        self.modified.iter().chain(self.removed.iter())
    }

    /// Number of changed CIDs.
    pub fn len(&self) -> usize {
        self.modified.len() + self.removed.len()
    }

    /// True when no CID changed.
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.removed.is_empty()
    }
}

/// What one invalidation run did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// CIDs in the change-set.
    pub changed_cids: usize,
    /// Queries in the invalidation closure.
    pub queries_invalidated: usize,
    /// Memo-cache entries actually evicted.
    pub entries_evicted: usize,
    /// Wall time of the run, in microseconds.
    pub elapsed_us: u64,
}

/// Walks the reverse indices and evicts the invalidation closure.
pub struct InvalidationEngine {
    cache: Arc<MemoCache>,
    graph: Arc<DependencyGraph>,
    min_severity: Severity,
}

impl InvalidationEngine {
    /// An engine over the given cache and graph, with the default
    /// `Minor` severity floor.
    pub fn new(cache: Arc<MemoCache>, graph: Arc<DependencyGraph>) -> Self {
        InvalidationEngine {
            cache,
            graph,
            min_severity: Severity::Minor,
        }
    }

    /// Adjusts the severity floor. `Cosmetic` still never invalidates.
    pub fn with_min_severity(mut self, min_severity: Severity) -> Self {
        self.min_severity = min_severity;
        self
    }

    /// Computes and evicts the invalidation closure of `change_set`.
    /// Never fails; a filtered or empty change-set reports zero work.
    pub fn invalidate(&self, change_set: &ChangeSet) -> InvalidationReport {
        let started = Instant::now();
        let severity = change_set.severity();
        if severity == Severity::Cosmetic || severity < self.min_severity {
            return InvalidationReport {
                changed_cids: change_set.len(),
                ..InvalidationReport::default()
            };
        }

        let mut queue: VecDeque<MemoKey> = VecDeque::new();
        let mut visited: FxHashSet<MemoKey> = FxHashSet::default();
        for cid in change_set.cids() {
            for key in self.graph.dependents_of_cid(cid) {
                if visited.insert(key) {
                    queue.push_back(key);
                }
            }
        }

        let mut evicted = 0usize;
        while let Some(key) = queue.pop_front() {
            // Collect dependents before the graph edges disappear.
            let dependents = self.graph.dependents_of_query(&key);
            if self.cache.remove(&key) {
                evicted += 1;
            }
            self.graph.remove(key);
            for dependent in dependents {
                if visited.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        let report = InvalidationReport {
            changed_cids: change_set.len(),
            queries_invalidated: visited.len(),
            entries_evicted: evicted,
            elapsed_us: started.elapsed().as_micros() as u64,
        };
        debug!(
            "invalidate: severity={:?} cids={} queries={} evicted={}",
            severity, report.changed_cids, report.queries_invalidated, report.entries_evicted,
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedResult;
    use crate::codec::{HoverInfo, QueryResult};
    use crate::deps::DepSet;
    use crate::key::QueryKind;

    fn key(tag: &[u8]) -> MemoKey {
        MemoKey::compute(QueryKind::Hover, tag)
    }

    fn cid(fill: u8) -> ContentId {
        ContentId([fill; 32])
    }

    fn cached(deps: DepSet) -> CachedResult {
        CachedResult {
            result: QueryResult::Hover(HoverInfo {
                text: "t".into(),
                type_name: "u".into(),
            }),
            deps,
        }
    }

    fn engine() -> (InvalidationEngine, Arc<MemoCache>, Arc<DependencyGraph>) {
        let cache = Arc::new(MemoCache::new());
        let graph = Arc::new(DependencyGraph::new());
        (
            InvalidationEngine::new(cache.clone(), graph.clone()),
            cache,
            graph,
        )
    }

    fn seed(cache: &MemoCache, graph: &DependencyGraph, key: MemoKey, deps: DepSet) {
        graph.record(key, &deps);
        cache.put(key, cached(deps));
    }

    #[test]
    fn cosmetic_change_invalidates_nothing() {
        let (engine, cache, graph) = engine();
        let k = key(b"k");
        let mut deps = DepSet::new();
        deps.record_cid(cid(1));
        seed(&cache, &graph, k, deps);

        let report = engine.invalidate(
            &ChangeSet::new().modify(cid(1)).with_severity(Severity::Cosmetic),
        );
        assert_eq!(report.queries_invalidated, 0);
        assert!(cache.contains(&k));
    }

    #[test]
    fn direct_dependent_is_evicted() {
        let (engine, cache, graph) = engine();
        let k = key(b"k");
        let mut deps = DepSet::new();
        deps.record_cid(cid(1));
        seed(&cache, &graph, k, deps);

        let report = engine.invalidate(&ChangeSet::new().modify(cid(1)));
        assert_eq!(report.queries_invalidated, 1);
        assert_eq!(report.entries_evicted, 1);
        assert!(!cache.contains(&k));
        assert!(graph.deps_of(&k).is_none());
    }

    #[test]
    fn closure_follows_query_dependents() {
        let (engine, cache, graph) = engine();
        let (leaf, mid, root) = (key(b"leaf"), key(b"mid"), key(b"root"));

        let mut leaf_deps = DepSet::new();
        leaf_deps.record_cid(cid(1));
        seed(&cache, &graph, leaf, leaf_deps);

        let mut mid_deps = DepSet::new();
        mid_deps.record_query(leaf);
        seed(&cache, &graph, mid, mid_deps);

        let mut root_deps = DepSet::new();
        root_deps.record_query(mid);
        seed(&cache, &graph, root, root_deps);

        // Unaffected bystander.
        let other = key(b"other");
        let mut other_deps = DepSet::new();
        other_deps.record_cid(cid(2));
        seed(&cache, &graph, other, other_deps);

        let report = engine.invalidate(&ChangeSet::new().modify(cid(1)));
        assert_eq!(report.queries_invalidated, 3);
        assert_eq!(report.entries_evicted, 3);
        assert!(!cache.contains(&leaf));
        assert!(!cache.contains(&mid));
        assert!(!cache.contains(&root));
        assert!(cache.contains(&other));
    }

    #[test]
    fn removed_cids_invalidate_like_modified() {
        let (engine, cache, graph) = engine();
        let k = key(b"k");
        let mut deps = DepSet::new();
        deps.record_cid(cid(3));
        seed(&cache, &graph, k, deps);

        let report = engine.invalidate(&ChangeSet::new().remove(cid(3)));
        assert_eq!(report.entries_evicted, 1);
        assert!(!cache.contains(&k));
    }

    #[test]
    fn severity_floor_filters_minor_changes() {
        let (engine, cache, graph) = engine();
        let engine = engine.with_min_severity(Severity::Major);
        let k = key(b"k");
        let mut deps = DepSet::new();
        deps.record_cid(cid(1));
        seed(&cache, &graph, k, deps);

        let skipped = engine.invalidate(
            &ChangeSet::new().modify(cid(1)).with_severity(Severity::Minor),
        );
        assert_eq!(skipped.queries_invalidated, 0);
        assert!(cache.contains(&k));

        let run = engine.invalidate(
            &ChangeSet::new().modify(cid(1)).with_severity(Severity::Major),
        );
        assert_eq!(run.entries_evicted, 1);
    }

    #[test]
    fn unknown_cid_reports_zero_work() {
        let (engine, _cache, _graph) = engine();
        let report = engine.invalidate(&ChangeSet::new().modify(cid(9)));
        assert_eq!(report.changed_cids, 1);
        assert_eq!(report.queries_invalidated, 0);
        assert_eq!(report.entries_evicted, 0);
    }
}
