//! Typed resource budgets for nurseries and tasks.
//!
//! A budget is a finite pool of units consumed by typed operations. Each
//! decrement either succeeds atomically or reports exhaustion and leaves
//! the pool unchanged; there is no floating point and no refund. Nurseries
//! share their budget with every task they spawn.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operations that draw on a budget, with their unit costs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BudgetCost {
    /// Spawning one task from a nursery.
    Spawn,
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
    /// One recursive call.
    RecursiveCall,
    /// One memo-cache miss.
    CacheMiss,
}

impl BudgetCost {
    /// Units this operation consumes.
    pub fn units(self) -> u64 {
        match self {
            BudgetCost::Spawn => 100,
            BudgetCost::NodeVisit => 1,
            BudgetCost::SymbolLookup => 10,
            BudgetCost::TypeInference => 50,
            BudgetCost::DispatchResolution => 100,
            BudgetCost::EffectAnalysis => 200,
            BudgetCost::IrGeneration => 500,
            BudgetCost::RecursiveCall => 25,
            BudgetCost::CacheMiss => 5,
        }
    }
}

/// A finite, atomically decremented pool of resource units.
#[derive(Debug)]
pub struct Budget {
    remaining: AtomicU64,
}

impl Budget {
    /// A pool holding `units`.
    pub fn new(units: u64) -> Self {
        Budget {
            remaining: AtomicU64::new(units),
        }
    }

    /// Default pool for a service-level nursery.
    pub fn service_default() -> Self {
        Budget::new(10_000_000)
    }

    /// Default pool for a spawned child task's nursery.
    pub fn child_default() -> Self {
        Budget::new(1_000_000)
    }

    /// An empty pool; every charge is rejected. Used by tests that
    /// exercise exhaustion paths.
    pub fn zero() -> Self {
        Budget::new(0)
    }

    /// Attempts one typed decrement. Returns `false` (leaving the pool
    /// unchanged) when fewer than `cost.units()` remain.
    pub fn try_charge(&self, cost: BudgetCost) -> bool {
        let units = cost.units();
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(units)
            })
            .is_ok()
    }

    /// Units left in the pool.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// True when even the cheapest operation would be rejected.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn charge_decrements_by_typed_units() {
        let budget = Budget::new(1_000);
        assert!(budget.try_charge(BudgetCost::Spawn));
        assert!(budget.try_charge(BudgetCost::NodeVisit));
        assert_eq!(budget.remaining(), 1_000 - 100 - 1);
    }

    #[test]
    fn exhaustion_leaves_pool_unchanged() {
        let budget = Budget::new(99);
        assert!(!budget.try_charge(BudgetCost::Spawn));
        assert_eq!(budget.remaining(), 99);
        assert!(budget.try_charge(BudgetCost::SymbolLookup));
        assert_eq!(budget.remaining(), 89);
    }

    #[test]
    fn zero_budget_rejects_everything() {
        let budget = Budget::zero();
        assert!(budget.is_exhausted());
        assert!(!budget.try_charge(BudgetCost::NodeVisit));
    }

    #[test]
    fn concurrent_charges_never_oversubscribe() {
        let budget = Arc::new(Budget::new(1_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let budget = budget.clone();
            handles.push(std::thread::spawn(move || {
                let mut granted = 0u64;
                while budget.try_charge(BudgetCost::SymbolLookup) {
                    granted += BudgetCost::SymbolLookup.units();
                }
                granted
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1_000);
        assert_eq!(budget.remaining(), 0);
    }
}
