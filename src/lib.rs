#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! Sovereign is the core runtime of an incremental language toolchain:
//! a demand-driven, memoized query engine with content-addressed
//! dependency tracking and precise invalidation, coupled to a
//! capability-budgeted M:N cooperative fiber scheduler hosting
//! structured-concurrency nurseries.
//!
//! The query side revolves around [`QueryEngine`]: hosts register a body
//! per [`QueryKind`], and `execute` canonicalizes the arguments, derives
//! a BLAKE3 memo key, and either answers from the sharded cache or runs
//! the body under dependency tracking, cycle detection, and a quota.
//! Change-sets flow through [`QueryEngine::invalidate`], which evicts
//! exactly the transitive dependents of the changed content.
//!
//! The scheduler side revolves around [`Runtime`]: worker threads run
//! fibers from work-stealing deques, and [`Nursery`] scopes own every
//! task spawned into them, with transitive cancellation and an
//! errors-beat-cancellation completion contract.

mod ast;
mod cache;
mod codec;
pub mod compat;
mod cycle;
mod deps;
mod error;
mod executor;
mod invalidate;
mod key;
mod quota;
pub mod sched;
mod telemetry;

pub use crate::ast::{AstDatabase, Declaration, NodeKind, NodeView};
pub use crate::cache::{CacheStats, CachedResult, MemoCache, SHARD_COUNT};
pub use crate::codec::{
    decode_args, decode_result, encode_args, encode_result, DefinitionInfo, DispatchInfo,
    EffectsInfo, HoverInfo, IrInfo, QueryArg, QueryResult, SymbolInfo, TypeInfo,
};
pub use crate::cycle::CycleDetector;
pub use crate::deps::{DepSet, DependencyGraph, DependencyTracker};
pub use crate::error::{QueryError, SchedError};
pub use crate::executor::{Execution, QueryBody, QueryCtx, QueryEngine};
pub use crate::invalidate::{ChangeSet, InvalidationEngine, InvalidationReport, Severity};
pub use crate::key::{ContentId, MemoKey, QueryKind};
pub use crate::quota::{Cost, Quota, QuotaKind, QuotaProfile};
pub use crate::sched::budget::{Budget, BudgetCost};
pub use crate::sched::nursery::{Nursery, NurseryOutcome, NurseryState};
pub use crate::sched::task::{
    BlockReason, Task, TaskId, TaskOutcome, TaskState, BUDGET_EXHAUSTED_CODE, PANIC_ERROR_CODE,
};
pub use crate::sched::worker::{
    current_task, in_fiber_context, yield_blocked, yield_complete, yield_now,
};
pub use crate::sched::{Runtime, RuntimeConfig};
pub use crate::telemetry::{GlobalStats, QuerySample, QueryStats, Telemetry};
