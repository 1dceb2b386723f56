//! The demand-driven query executor.
//!
//! `execute` is the one path every semantic query takes: canonicalize the
//! arguments, derive the memo key, consult the cache, and only then run
//! the registered body under dependency tracking, cycle detection, and a
//! quota. Bodies are external collaborators; they reach the AST and issue
//! sub-queries exclusively through the [`QueryCtx`] they are handed, which
//! is how every read becomes a recorded dependency.
//!
//! On any failure no cache entry is written, no graph edges are added,
//! and the cycle-detector entry is released.

use crate::ast::{AstDatabase, Declaration, NodeView};
use crate::cache::{CacheStats, CachedResult, MemoCache};
use crate::codec::{self, QueryArg, QueryResult};
use crate::cycle::CycleDetector;
use crate::deps::{DepSet, DependencyGraph, DependencyTracker};
use crate::error::QueryError;
use crate::invalidate::{ChangeSet, InvalidationEngine, InvalidationReport, Severity};
use crate::key::{ContentId, MemoKey, QueryKind};
use crate::quota::{Cost, Quota, QuotaProfile};
use crate::telemetry::{QuerySample, Telemetry};
use log::{debug, info};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// A registered query body: from context and canonical arguments to a
/// result variant.
pub type QueryBody =
    dyn Fn(&mut QueryCtx<'_>, &[QueryArg]) -> Result<QueryResult, QueryError> + Send + Sync;

/// What `execute` hands back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    /// The result variant.
    pub result: QueryResult,
    /// Dependencies captured during execution (empty on a cache hit only
    /// if the original execution observed nothing).
    pub deps: DepSet,
    /// Whether the memo cache satisfied the call.
    pub from_cache: bool,
}

/// Per-top-level-call execution state: the tracker frames, the chain of
/// active memo keys on this call stack, and the sub-query nesting depth.
#[derive(Default)]
struct ExecState {
    tracker: DependencyTracker,
    active: Vec<MemoKey>,
    depth: u32,
}

/// The query engine: memo cache, dependency graph, cycle detector,
/// telemetry, and the registry of query bodies, behind one handle.
pub struct QueryEngine {
    ast: Arc<dyn AstDatabase>,
    cache: Arc<MemoCache>,
    graph: Arc<DependencyGraph>,
    cycles: CycleDetector,
    telemetry: Arc<Telemetry>,
    invalidation: InvalidationEngine,
    bodies: RwLock<FxHashMap<QueryKind, Arc<QueryBody>>>,
    profile: QuotaProfile,
}

impl QueryEngine {
    /// An engine over `ast` with the given quota profile and the default
    /// invalidation severity floor.
    pub fn new(ast: Arc<dyn AstDatabase>, profile: QuotaProfile) -> Self {
        let cache = Arc::new(MemoCache::new());
        let graph = Arc::new(DependencyGraph::new());
        QueryEngine {
            ast,
            invalidation: InvalidationEngine::new(cache.clone(), graph.clone()),
            cache,
            graph,
            cycles: CycleDetector::new(),
            telemetry: Arc::new(Telemetry::new()),
            bodies: RwLock::new(FxHashMap::default()),
            profile,
        }
    }

    /// Adjusts the invalidation severity floor.
    pub fn with_min_severity(mut self, min_severity: Severity) -> Self {
        self.invalidation = InvalidationEngine::new(self.cache.clone(), self.graph.clone())
            .with_min_severity(min_severity);
        self
    }

    /// Registers (or replaces) the body for `kind`.
    pub fn register<F>(&self, kind: QueryKind, body: F)
    where
        F: Fn(&mut QueryCtx<'_>, &[QueryArg]) -> Result<QueryResult, QueryError>
            + Send
            + Sync
            + 'static,
    {
        self.bodies.write().insert(kind, Arc::new(body));
    }

    /// Executes `kind` over `args`: cache hit or a fresh run of the
    /// registered body under tracking.
    pub fn execute(&self, kind: QueryKind, args: &[QueryArg]) -> Result<Execution, QueryError> {
        let mut state = ExecState::default();
        self.execute_inner(&mut state, kind, args)
            .map(|(execution, _key)| execution)
    }

    /// Consumes a change-set: computes the invalidation closure, evicts
    /// it, and feeds the report to telemetry.
    pub fn invalidate(&self, change_set: &ChangeSet) -> InvalidationReport {
        let report = self.invalidation.invalidate(change_set);
        self.telemetry
            .record_invalidation(report.queries_invalidated as u64);
        report
    }

    /// The memo key `execute` would use for this call.
    pub fn memo_key(&self, kind: QueryKind, args: &[QueryArg]) -> MemoKey {
        MemoKey::compute(kind, &codec::encode_args(args))
    }

    /// Telemetry sink.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Aggregated cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Live cache entries.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// The recorded dependency set of a memoized query.
    pub fn deps_of(&self, key: &MemoKey) -> Option<DepSet> {
        self.graph.deps_of(key)
    }

    fn execute_inner(
        &self,
        state: &mut ExecState,
        kind: QueryKind,
        args: &[QueryArg],
    ) -> Result<(Execution, MemoKey), QueryError> {
        let started = Instant::now();
        let canonical = codec::encode_args(args);
        let key = MemoKey::compute(kind, &canonical);

        if let Some(hit) = self.cache.get(&key) {
            debug!("{:?}: hit for {:?}", kind, key);
            self.sample(kind, started, 0, 0, true);
            return Ok((
                Execution {
                    result: hit.result,
                    deps: hit.deps,
                    from_cache: true,
                },
                key,
            ));
        }

        // The edge from the caller must exist before the child starts so
        // that a cycle closing back into the active chain is refused at
        // the deepest point.
        if let Some(&parent) = state.active.last() {
            self.cycles.add_dependency(parent, key)?;
        }
        self.cycles.start(key)?;
        state.active.push(key);
        state.tracker.start_tracking();

        info!("{:?}: executing {:?}", kind, key);
        let mut quota = Quota::new(self.profile);
        let outcome = self.run_body(state, key, kind, args, &mut quota);

        let deps = state.tracker.stop_tracking().unwrap_or_default();
        state.active.pop();
        self.cycles.finish(key);

        match outcome {
            Ok(result) => {
                self.cache.put(
                    key,
                    CachedResult {
                        result: result.clone(),
                        deps: deps.clone(),
                    },
                );
                self.graph.record(key, &deps);
                self.sample(
                    kind,
                    started,
                    quota.bytes_allocated(),
                    quota.nodes_visited(),
                    false,
                );
                Ok((
                    Execution {
                        result,
                        deps,
                        from_cache: false,
                    },
                    key,
                ))
            }
            Err(err) => {
                if matches!(err, QueryError::QuotaExceeded(_)) {
                    self.telemetry.record_quota_exceeded();
                }
                debug!("{:?}: {:?} failed: {}", kind, key, err);
                Err(err)
            }
        }
    }

    fn run_body(
        &self,
        state: &mut ExecState,
        key: MemoKey,
        kind: QueryKind,
        args: &[QueryArg],
        quota: &mut Quota,
    ) -> Result<QueryResult, QueryError> {
        quota.charge(Cost::CacheMiss)?;
        let body = self
            .bodies
            .read()
            .get(&kind)
            .cloned()
            .ok_or(QueryError::UnregisteredQuery(kind.tag_name()))?;
        let mut ctx = QueryCtx {
            engine: self,
            state,
            quota,
            key,
        };
        (*body)(&mut ctx, args)
    }

    fn sample(&self, kind: QueryKind, started: Instant, bytes: u64, nodes: u64, cache_hit: bool) {
        self.telemetry.record_sample(
            kind,
            QuerySample {
                duration: started.elapsed(),
                bytes,
                nodes,
                cache_hit,
                at: SystemTime::now(),
            },
        );
    }
}

/// The capability a query body executes against.
///
/// Every AST read and sub-query goes through here so it lands in the
/// current dependency frame and is charged against the quota. Bodies
/// never see the engine directly.
pub struct QueryCtx<'a> {
    engine: &'a QueryEngine,
    state: &'a mut ExecState,
    quota: &'a mut Quota,
    key: MemoKey,
}

impl<'a> QueryCtx<'a> {
    /// Reads one AST node. Charges `NodeVisit` and records a content
    /// dependency on `cid`.
    pub fn node(&mut self, cid: ContentId) -> Result<NodeView, QueryError> {
        self.quota.charge(Cost::NodeVisit)?;
        self.state.tracker.record_cid(cid);
        self.engine.ast.node(cid)
    }

    /// Lists a scope's declarations. Charges `SymbolLookup` and records a
    /// content dependency on the scope.
    pub fn declarations(&mut self, scope: ContentId) -> Result<Vec<Declaration>, QueryError> {
        self.quota.charge(Cost::SymbolLookup)?;
        self.state.tracker.record_cid(scope);
        self.engine.ast.declarations(scope)
    }

    /// Records a raw content dependency without an AST lookup.
    pub fn record_cid(&mut self, cid: ContentId) {
        self.state.tracker.record_cid(cid);
    }

    /// Charges one typed operation against this query's quota.
    pub fn charge(&mut self, cost: Cost) -> Result<(), QueryError> {
        self.quota.charge(cost)
    }

    /// Accounts an allocation against this query's memory limit.
    pub fn record_alloc(&mut self, bytes: u64) -> Result<(), QueryError> {
        self.quota.record_alloc(bytes)
    }

    /// Issues a sub-query through the same executor. The child captures
    /// into its own frame; on return this query records a dependency on
    /// the child's memo key. Depth consumed by a failing child is not
    /// handed back.
    pub fn subquery(
        &mut self,
        kind: QueryKind,
        args: &[QueryArg],
    ) -> Result<QueryResult, QueryError> {
        self.quota.charge(Cost::RecursiveCall)?;
        self.state.depth += 1;
        self.quota.check_depth(self.state.depth)?;

        let (execution, child_key) = self.engine.execute_inner(self.state, kind, args)?;
        self.state.depth -= 1;
        self.state.tracker.record_query(child_key);
        Ok(execution.result)
    }

    /// The memo key of the query this body is computing.
    pub fn memo_key(&self) -> MemoKey {
        self.key
    }
}
