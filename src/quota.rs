//! Per-query resource accounting.
//!
//! Every executing query carries a [`Quota`]: live usage counters checked
//! against the static limits of a [`QuotaProfile`]. A charge that would
//! cross any limit fails with [`QueryError::QuotaExceeded`] and leaves the
//! counters unchanged; the executor then aborts the query without caching.
//!
//! Recursion depth is tracked by the executor across nested frames and
//! checked here. A failed sub-query does not re-credit the depth it
//! consumed; see DESIGN.md.

use crate::error::QueryError;
use std::time::{Duration, Instant};

/// Typed operation costs, in gas units.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cost {
    /// Visiting one AST node.
    NodeVisit,
    /// One scope/declaration lookup.
    SymbolLookup,
    /// One type-inference step.
    TypeInference,
    /// Resolving one dispatch site.
    DispatchResolution,
    /// Analyzing the effects of one body.
    EffectAnalysis,
    /// Lowering one definition to IR.
    IrGeneration,
    /// Issuing one sub-query.
    RecursiveCall,
    /// Taking a memo-cache miss.
    CacheMiss,
}

impl Cost {
    /// Gas units this operation consumes.
    pub fn gas(self) -> u64 {
        match self {
            Cost::NodeVisit => 1,
            Cost::SymbolLookup => 10,
            Cost::TypeInference => 50,
            Cost::DispatchResolution => 100,
            Cost::EffectAnalysis => 200,
            Cost::IrGeneration => 500,
            Cost::RecursiveCall => 25,
            Cost::CacheMiss => 5,
        }
    }
}

/// Which limit a quota failure crossed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QuotaKind {
    /// Wall-clock limit.
    WallTime,
    /// Allocated-byte limit.
    Memory,
    /// Node-visit limit.
    NodeVisits,
    /// Sub-query nesting limit.
    RecursionDepth,
    /// Gas-unit limit.
    Gas,
}

/// Static limits for one query execution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuotaProfile {
    /// Wall-clock budget, checked at charge points.
    pub max_wall: Duration,
    /// Bytes the execution may account via `record_alloc`.
    pub max_bytes: u64,
    /// AST nodes the execution may visit.
    pub max_nodes: u64,
    /// Maximum sub-query nesting depth.
    pub max_depth: u32,
    /// Total gas units.
    pub max_gas: u64,
}

impl QuotaProfile {
    /// Editor-latency profile: 10ms / 10MiB / 10K nodes / depth 100 / 1M gas.
    pub fn interactive() -> Self {
        QuotaProfile {
            max_wall: Duration::from_millis(10),
            max_bytes: 10 << 20,
            max_nodes: 10_000,
            max_depth: 100,
            max_gas: 1_000_000,
        }
    }

    /// Background-indexing profile: 1s / 100MiB / 1M nodes / depth 1000 /
    /// 100M gas.
    pub fn background() -> Self {
        QuotaProfile {
            max_wall: Duration::from_secs(1),
            max_bytes: 100 << 20,
            max_nodes: 1_000_000,
            max_depth: 1_000,
            max_gas: 100_000_000,
        }
    }

    /// Whole-program batch profile: 60s / 1GiB / 10M nodes / depth 10000 /
    /// 1G gas.
    pub fn batch() -> Self {
        QuotaProfile {
            max_wall: Duration::from_secs(60),
            max_bytes: 1 << 30,
            max_nodes: 10_000_000,
            max_depth: 10_000,
            max_gas: 1_000_000_000,
        }
    }
}

/// Live usage counters for one executing query.
#[derive(Debug)]
pub struct Quota {
    profile: QuotaProfile,
    started: Instant,
    gas_used: u64,
    nodes_visited: u64,
    bytes_allocated: u64,
}

impl Quota {
    /// Starts a fresh accounting window against `profile`.
    pub fn new(profile: QuotaProfile) -> Self {
        Quota {
            profile,
            started: Instant::now(),
            gas_used: 0,
            nodes_visited: 0,
            bytes_allocated: 0,
        }
    }

    /// Charges one typed operation. Fails without mutating state if any
    /// limit would be crossed.
    pub fn charge(&mut self, cost: Cost) -> Result<(), QueryError> {
        self.check_wall()?;

        let gas = self.gas_used.saturating_add(cost.gas());
        if gas > self.profile.max_gas {
            return Err(QueryError::QuotaExceeded(QuotaKind::Gas));
        }

        if cost == Cost::NodeVisit {
            let nodes = self.nodes_visited + 1;
            if nodes > self.profile.max_nodes {
                return Err(QueryError::QuotaExceeded(QuotaKind::NodeVisits));
            }
            self.nodes_visited = nodes;
        }

        self.gas_used = gas;
        Ok(())
    }

    /// Accounts `bytes` of allocation against the memory limit.
    pub fn record_alloc(&mut self, bytes: u64) -> Result<(), QueryError> {
        let total = self.bytes_allocated.saturating_add(bytes);
        if total > self.profile.max_bytes {
            return Err(QueryError::QuotaExceeded(QuotaKind::Memory));
        }
        self.bytes_allocated = total;
        Ok(())
    }

    /// Checks the executor-maintained nesting depth against the profile.
    pub fn check_depth(&self, depth: u32) -> Result<(), QueryError> {
        if depth > self.profile.max_depth {
            return Err(QueryError::QuotaExceeded(QuotaKind::RecursionDepth));
        }
        Ok(())
    }

    fn check_wall(&self) -> Result<(), QueryError> {
        if self.started.elapsed() > self.profile.max_wall {
            return Err(QueryError::QuotaExceeded(QuotaKind::WallTime));
        }
        Ok(())
    }

    /// Gas consumed so far.
    #[inline]
    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    /// Nodes visited so far.
    #[inline]
    pub fn nodes_visited(&self) -> u64 {
        self.nodes_visited
    }

    /// Bytes accounted so far.
    #[inline]
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }
}
