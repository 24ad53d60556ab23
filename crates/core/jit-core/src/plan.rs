//! Optimization plans and their ownership
//!
//! A plan says how a method should be compiled. Plans produced by the
//! controller come from a bounded [`PlanPool`]; when the pool is exhausted the
//! controller reports out-of-memory and the dispatcher may fall back to a
//! caller-owned plan that never touches the pool.

use crate::error::CompilationErrorCode;
use crate::hotness::OptLevel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a method should be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub opt_level: OptLevel,
    /// Compile a profiling body
    pub insert_instrumentation: bool,
    /// Body participates in sampling-based recompilation
    pub use_sampling: bool,
    /// Requested explicitly (compile-class and friends)
    pub explicit: bool,
    pub gpu: bool,
    pub induced_by_dlt: bool,
    /// Upgrade of an existing body rather than a first-time compile
    pub is_upgrade: bool,
    /// Outcome written back by the compilation thread
    pub result: Option<CompilationErrorCode>,
}

impl OptimizationPlan {
    pub fn new(opt_level: OptLevel) -> Self {
        Self {
            opt_level,
            insert_instrumentation: false,
            use_sampling: true,
            explicit: false,
            gpu: false,
            induced_by_dlt: false,
            is_upgrade: false,
            result: None,
        }
    }

    pub fn with_instrumentation(mut self) -> Self {
        self.insert_instrumentation = true;
        self
    }
}

/// Plan together with who is responsible for releasing it.
///
/// `QueueOwned` plans hold a lease on the [`PlanPool`] that is returned when
/// the handle is dropped, wherever that happens (caller on a non-queued
/// request, compilation thread after a queued one).
#[derive(Debug)]
pub enum PlanHandle {
    CallerOwned(OptimizationPlan),
    QueueOwned(PooledPlan),
}

impl PlanHandle {
    pub fn plan(&self) -> &OptimizationPlan {
        match self {
            PlanHandle::CallerOwned(plan) => plan,
            PlanHandle::QueueOwned(pooled) => &pooled.plan,
        }
    }

    pub fn plan_mut(&mut self) -> &mut OptimizationPlan {
        match self {
            PlanHandle::CallerOwned(plan) => plan,
            PlanHandle::QueueOwned(pooled) => &mut pooled.plan,
        }
    }

    pub fn is_caller_owned(&self) -> bool {
        matches!(self, PlanHandle::CallerOwned(_))
    }
}

/// Heap plan leased from a [`PlanPool`].
#[derive(Debug)]
pub struct PooledPlan {
    plan: Box<OptimizationPlan>,
    _lease: PlanLease,
}

#[derive(Debug)]
struct PlanLease {
    live: Arc<AtomicUsize>,
}

impl Drop for PlanLease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded allocator for controller plans.
#[derive(Debug, Clone)]
pub struct PlanPool {
    live: Arc<AtomicUsize>,
    capacity: usize,
}

impl PlanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Allocate a plan, or `None` when the pool is exhausted.
    pub fn alloc(&self, plan: OptimizationPlan) -> Option<PlanHandle> {
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .is_ok();
        if !reserved {
            return None;
        }
        Some(PlanHandle::QueueOwned(PooledPlan {
            plan: Box::new(plan),
            _lease: PlanLease {
                live: Arc::clone(&self.live),
            },
        }))
    }

    /// Plans currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PlanPool {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_release() {
        let pool = PlanPool::new(2);
        let a = pool.alloc(OptimizationPlan::new(OptLevel::Warm)).unwrap();
        let _b = pool.alloc(OptimizationPlan::new(OptLevel::Hot)).unwrap();
        assert!(pool.alloc(OptimizationPlan::new(OptLevel::Cold)).is_none());
        assert_eq!(pool.live(), 2);

        drop(a);
        assert_eq!(pool.live(), 1);
        assert!(pool.alloc(OptimizationPlan::new(OptLevel::Cold)).is_some());
    }

    #[test]
    fn test_caller_owned_bypasses_pool() {
        let pool = PlanPool::new(0);
        assert!(pool.alloc(OptimizationPlan::new(OptLevel::NoOpt)).is_none());
        let mut handle = PlanHandle::CallerOwned(OptimizationPlan::new(OptLevel::NoOpt));
        handle.plan_mut().result = Some(CompilationErrorCode::Ok);
        assert!(handle.is_caller_owned());
        assert_eq!(handle.plan().result, Some(CompilationErrorCode::Ok));
        assert_eq!(pool.live(), 0);
    }
}
