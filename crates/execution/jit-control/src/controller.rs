//! Compilation controller: turns method events into optimization plans

use jit_core::{
    BodyTable, CompilationConfig, MethodEvent, MethodEventType, MethodHandle, OptLevel,
    OptimizationPlan, PlanHandle, PlanPool, RecompilationReason,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Runtime facts the strategy consults for one event.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub bodies: &'a BodyTable,
    pub code_cache_almost_full: bool,
    /// Application threads currently attached
    pub active_threads: i32,
    pub startup_phase: bool,
    pub async_compilation: bool,
    /// The configured compilation delay after startup has passed
    pub compilation_delay_elapsed: bool,
}

/// Outcome of planning for one event.
#[derive(Debug)]
pub enum PlanDecision {
    Compile {
        plan: PlanHandle,
        new_plan_created: bool,
    },
    /// Nothing to compile for this event
    NoCompile,
    /// Planning metadata could not be allocated
    OutOfMemory,
}

impl PlanDecision {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, PlanDecision::OutOfMemory)
    }
}

pub trait CompilationStrategy: Send + Sync {
    fn process_event(&self, event: &MethodEvent, ctx: &StrategyContext<'_>) -> PlanDecision;

    fn initial_opt_level(&self, method: &MethodHandle) -> OptLevel;
}

/// Counting-and-sampling strategy.
#[derive(Debug)]
pub struct DefaultCompilationStrategy {
    config: CompilationConfig,
    pool: PlanPool,
}

impl DefaultCompilationStrategy {
    pub fn new(config: CompilationConfig) -> Self {
        let pool = PlanPool::new(config.plan_pool_capacity);
        Self { config, pool }
    }

    pub fn pool(&self) -> &PlanPool {
        &self.pool
    }

    fn alloc(&self, plan: OptimizationPlan) -> PlanDecision {
        match self.pool.alloc(plan) {
            Some(plan) => PlanDecision::Compile {
                plan,
                new_plan_created: true,
            },
            None => PlanDecision::OutOfMemory,
        }
    }

    fn counter_tripped(&self, method: &MethodHandle, ctx: &StrategyContext<'_>) -> PlanDecision {
        let level = self.initial_opt_level(method);
        let mut plan = OptimizationPlan::new(level);
        if level == OptLevel::VeryHot && self.config.enable_profiling && !ctx.code_cache_almost_full
        {
            plan = plan.with_instrumentation();
        }
        self.alloc(plan)
    }

    fn recompilation(&self, event: &MethodEvent, ctx: &StrategyContext<'_>) -> PlanDecision {
        let info = event.method.persistent_info();
        if let Some(attached) = info.take_attached_plan() {
            return match self.pool.alloc(attached.clone()) {
                Some(plan) => PlanDecision::Compile {
                    plan,
                    new_plan_created: false,
                },
                None => {
                    // Stays attached for the next recompilation attempt.
                    info.attach_plan(attached);
                    PlanDecision::OutOfMemory
                }
            };
        }
        let Some(body) = event.old_start_pc.and_then(|pc| ctx.bodies.get(pc)) else {
            return self.counter_tripped(&event.method, ctx);
        };
        let reason = info.reason_for_recompilation();
        let keep_level = reason == RecompilationReason::InlinedMethodRedefinition
            || (reason == RecompilationReason::JProfiling && !body.is_profiling_body());
        let level = if keep_level {
            body.hotness()
        } else {
            body.hotness().next()
        };
        if reason == RecompilationReason::Unknown {
            info.set_reason_for_recompilation(RecompilationReason::Counting);
        }
        let mut plan = OptimizationPlan::new(level);
        plan.is_upgrade = true;
        plan.use_sampling = body.uses_sampling();
        self.alloc(plan)
    }

    fn invalidated(&self, event: &MethodEvent, ctx: &StrategyContext<'_>) -> PlanDecision {
        let invalidations = event.method.persistent_info().increment_invalidations();
        let level = event
            .old_start_pc
            .and_then(|pc| ctx.bodies.get(pc))
            .map(|body| body.hotness())
            .unwrap_or_else(|| self.initial_opt_level(&event.method));
        debug!(target: "jit::dispatch", method = %event.method, invalidations, %level, "planning replacement for invalidated body");
        self.alloc(OptimizationPlan::new(level))
    }

    fn interpreted_sample(&self, method: &MethodHandle, ctx: &StrategyContext<'_>) -> PlanDecision {
        let Some(count) = method.invocation_count() else {
            return PlanDecision::NoCompile;
        };
        let active = ctx.active_threads;
        let compile_now = || {
            if ctx.async_compilation && ctx.compilation_delay_elapsed {
                self.alloc(OptimizationPlan::new(self.initial_opt_level(method)))
            } else {
                PlanDecision::NoCompile
            }
        };

        if count > 0 {
            let (threshold, divisor) = if ctx.startup_phase {
                (
                    self.config.interpreter_sample_threshold_startup,
                    self.config.interpreter_sample_divisor_startup,
                )
            } else {
                (
                    self.config.interpreter_sample_threshold,
                    self.config.interpreter_sample_divisor,
                )
            };
            let divisor = if count <= threshold && count > active {
                divisor
            } else if method.flags().has_backward_branches && count > active {
                self.config.loopy_method_division_factor
            } else {
                trace!(target: "jit::sampler", method = %method, count, threshold, "count left unchanged");
                return PlanDecision::NoCompile;
            };
            let new_count = (count / divisor.max(1)).max(active);
            if method.compare_and_set_count(count, new_count) {
                trace!(target: "jit::sampler", method = %method, count, new_count, "reducing count");
            }
            if new_count == 0 {
                return compile_now();
            }
            PlanDecision::NoCompile
        } else if count == 0 {
            // Long-running activation whose count already reached zero.
            compile_now()
        } else {
            PlanDecision::NoCompile
        }
    }

    fn jitted_sample(&self, event: &MethodEvent, ctx: &StrategyContext<'_>) -> PlanDecision {
        let Some(body) = event.old_start_pc.and_then(|pc| ctx.bodies.get(pc)) else {
            return PlanDecision::NoCompile;
        };
        if body.is_invalidated() || body.is_obsolete() || !body.uses_sampling() {
            return PlanDecision::NoCompile;
        }
        let samples = body.record_sample();
        if samples < self.config.jitted_sample_recompile_threshold
            || body.hotness() == OptLevel::Scorching
            || body.linkage().recompilation_attempted()
        {
            return PlanDecision::NoCompile;
        }
        body.linkage().set_recompilation_attempted();
        event
            .method
            .persistent_info()
            .set_reason_for_recompilation(RecompilationReason::Sampling);
        let mut plan = OptimizationPlan::new(body.hotness().next());
        plan.is_upgrade = true;
        debug!(target: "jit::sampler", method = %event.method, samples, level = %plan.opt_level, "sampling upgrade");
        self.alloc(plan)
    }
}

impl CompilationStrategy for DefaultCompilationStrategy {
    fn process_event(&self, event: &MethodEvent, ctx: &StrategyContext<'_>) -> PlanDecision {
        let method = &event.method;
        match event.event_type {
            MethodEventType::InterpreterCounterTripped => self.counter_tripped(method, ctx),
            MethodEventType::JitCompilationInducedByDlt => {
                let mut plan = OptimizationPlan::new(self.initial_opt_level(method));
                plan.induced_by_dlt = true;
                self.alloc(plan)
            }
            MethodEventType::OtherRecompilationTrigger => self.recompilation(event, ctx),
            MethodEventType::NewInstanceImpl => {
                self.alloc(OptimizationPlan::new(self.config.initial_opt_level))
            }
            MethodEventType::ShareableMethodHandleThunk
            | MethodEventType::CustomMethodHandleThunk => {
                let mut level = self.initial_opt_level(method);
                if event.event_type == MethodEventType::CustomMethodHandleThunk {
                    level = level.max(OptLevel::Warm);
                }
                let mut plan = OptimizationPlan::new(level);
                plan.use_sampling = false;
                self.alloc(plan)
            }
            MethodEventType::MethodBodyInvalidated => self.invalidated(event, ctx),
            MethodEventType::InterpretedMethodSample => self.interpreted_sample(method, ctx),
            MethodEventType::JittedMethodSample => self.jitted_sample(event, ctx),
            MethodEventType::ExplicitCompilation => {
                let mut plan = OptimizationPlan::new(self.initial_opt_level(method));
                plan.explicit = true;
                self.alloc(plan)
            }
            MethodEventType::GpuLaunch => {
                let mut plan = OptimizationPlan::new(OptLevel::Hot);
                plan.gpu = true;
                self.alloc(plan)
            }
            MethodEventType::ForcedRecompilationPostRestore => {
                method
                    .persistent_info()
                    .set_reason_for_recompilation(RecompilationReason::ForcedPostRestore);
                self.alloc(OptimizationPlan::new(OptLevel::Warm))
            }
        }
    }

    fn initial_opt_level(&self, method: &MethodHandle) -> OptLevel {
        if method.flags().has_backward_branches {
            self.config.initial_opt_level_loopy
        } else {
            self.config.initial_opt_level
        }
    }
}

/// Front door to the strategy; keeps per-event statistics.
pub struct CompilationController {
    strategy: Box<dyn CompilationStrategy>,
    events: [AtomicU64; MethodEventType::ALL.len()],
    out_of_memory: AtomicU64,
}

impl std::fmt::Debug for CompilationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationController")
            .field("out_of_memory", &self.out_of_memory)
            .finish_non_exhaustive()
    }
}

impl CompilationController {
    pub fn new(strategy: Box<dyn CompilationStrategy>) -> Self {
        Self {
            strategy,
            events: std::array::from_fn(|_| AtomicU64::new(0)),
            out_of_memory: AtomicU64::new(0),
        }
    }

    pub fn with_default_strategy(config: &CompilationConfig) -> Self {
        Self::new(Box::new(DefaultCompilationStrategy::new(config.clone())))
    }

    pub fn strategy(&self) -> &dyn CompilationStrategy {
        self.strategy.as_ref()
    }

    pub fn process_event(&self, event: &MethodEvent, ctx: &StrategyContext<'_>) -> PlanDecision {
        self.events[event.event_type.index()].fetch_add(1, Ordering::Relaxed);
        let decision = self.strategy.process_event(event, ctx);
        if decision.is_out_of_memory() {
            self.out_of_memory.fetch_add(1, Ordering::Relaxed);
            warn!(target: "jit::dispatch", method = %event.method, event = ?event.event_type, "no memory for an optimization plan");
        }
        decision
    }

    pub fn event_counts(&self) -> Vec<(MethodEventType, u64)> {
        MethodEventType::ALL
            .iter()
            .map(|t| (*t, self.events[t.index()].load(Ordering::Relaxed)))
            .collect()
    }

    pub fn event_count(&self, event_type: MethodEventType) -> u64 {
        self.events[event_type.index()].load(Ordering::Relaxed)
    }

    pub fn out_of_memory_events(&self) -> u64 {
        self.out_of_memory.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jit_core::{BodyDescriptor, JittedBodyInfo, MethodFlags, StartPc};

    fn ctx(bodies: &BodyTable) -> StrategyContext<'_> {
        StrategyContext {
            bodies,
            code_cache_almost_full: false,
            active_threads: 0,
            startup_phase: false,
            async_compilation: true,
            compilation_delay_elapsed: true,
        }
    }

    fn method(loopy: bool) -> MethodHandle {
        MethodHandle::new(
            "c/C",
            "m",
            "()V",
            MethodFlags {
                has_backward_branches: loopy,
                ..MethodFlags::default()
            },
        )
    }

    fn level(decision: PlanDecision) -> OptLevel {
        match decision {
            PlanDecision::Compile { plan, .. } => plan.plan().opt_level,
            other => panic!("expected a plan, got {other:?}"),
        }
    }

    fn register(bodies: &BodyTable, method: &MethodHandle, pc: u64, hotness: OptLevel) {
        bodies.register(JittedBodyInfo::new(
            method.clone(),
            BodyDescriptor {
                start_pc: StartPc(pc),
                hotness,
                is_profiling_body: false,
                uses_sampling: true,
                code_cache_id: 0,
                code_size: 64,
                data_size: 16,
            },
        ));
    }

    #[test]
    fn test_counter_trip_uses_loopy_level() {
        let config = CompilationConfig {
            initial_opt_level_loopy: OptLevel::Hot,
            ..CompilationConfig::default()
        };
        let strategy = DefaultCompilationStrategy::new(config);
        let bodies = BodyTable::new();
        let event = MethodEvent::new(MethodEventType::InterpreterCounterTripped, method(true));
        assert_eq!(level(strategy.process_event(&event, &ctx(&bodies))), OptLevel::Hot);
        let event = MethodEvent::new(MethodEventType::InterpreterCounterTripped, method(false));
        assert_eq!(level(strategy.process_event(&event, &ctx(&bodies))), OptLevel::Warm);
    }

    #[test]
    fn test_very_hot_start_gets_instrumented_unless_cache_tight() {
        let config = CompilationConfig {
            initial_opt_level: OptLevel::VeryHot,
            ..CompilationConfig::default()
        };
        let strategy = DefaultCompilationStrategy::new(config);
        let bodies = BodyTable::new();
        let event = MethodEvent::new(MethodEventType::InterpreterCounterTripped, method(false));
        match strategy.process_event(&event, &ctx(&bodies)) {
            PlanDecision::Compile { plan, .. } => assert!(plan.plan().insert_instrumentation),
            other => panic!("{other:?}"),
        }
        let tight = StrategyContext {
            code_cache_almost_full: true,
            ..ctx(&bodies)
        };
        match strategy.process_event(&event, &tight) {
            PlanDecision::Compile { plan, .. } => assert!(!plan.plan().insert_instrumentation),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_recompilation_levels() {
        let strategy = DefaultCompilationStrategy::new(CompilationConfig::default());
        let bodies = BodyTable::new();
        let m = method(false);
        register(&bodies, &m, 0x100, OptLevel::Warm);
        let event = MethodEvent::new(MethodEventType::OtherRecompilationTrigger, m.clone())
            .with_old_start_pc(Some(StartPc(0x100)));

        assert_eq!(level(strategy.process_event(&event, &ctx(&bodies))), OptLevel::Hot);
        assert_eq!(
            m.persistent_info().reason_for_recompilation(),
            RecompilationReason::Counting
        );

        m.persistent_info()
            .set_reason_for_recompilation(RecompilationReason::InlinedMethodRedefinition);
        assert_eq!(level(strategy.process_event(&event, &ctx(&bodies))), OptLevel::Warm);

        m.persistent_info()
            .attach_plan(OptimizationPlan::new(OptLevel::Scorching));
        assert_eq!(level(strategy.process_event(&event, &ctx(&bodies))), OptLevel::Scorching);
    }

    #[test]
    fn test_thunks_and_special_events() {
        let strategy = DefaultCompilationStrategy::new(CompilationConfig {
            initial_opt_level: OptLevel::Cold,
            ..CompilationConfig::default()
        });
        let bodies = BodyTable::new();
        let m = method(false);
        let custom = MethodEvent::new(MethodEventType::CustomMethodHandleThunk, m.clone());
        match strategy.process_event(&custom, &ctx(&bodies)) {
            PlanDecision::Compile { plan, .. } => {
                assert_eq!(plan.plan().opt_level, OptLevel::Warm);
                assert!(!plan.plan().use_sampling);
            }
            other => panic!("{other:?}"),
        }
        let shareable = MethodEvent::new(MethodEventType::ShareableMethodHandleThunk, m.clone());
        assert_eq!(level(strategy.process_event(&shareable, &ctx(&bodies))), OptLevel::Cold);
        let gpu = MethodEvent::new(MethodEventType::GpuLaunch, m.clone());
        match strategy.process_event(&gpu, &ctx(&bodies)) {
            PlanDecision::Compile { plan, .. } => {
                assert_eq!(plan.plan().opt_level, OptLevel::Hot);
                assert!(plan.plan().gpu);
            }
            other => panic!("{other:?}"),
        }
        let restore = MethodEvent::new(MethodEventType::ForcedRecompilationPostRestore, m);
        assert_eq!(level(strategy.process_event(&restore, &ctx(&bodies))), OptLevel::Warm);
    }

    #[test]
    fn test_interpreter_sample_decays_count() {
        let strategy = DefaultCompilationStrategy::new(CompilationConfig::default());
        let bodies = BodyTable::new();
        let m = MethodHandle::with_count("c/C", "s", "()V", MethodFlags::default(), 200);
        let event = MethodEvent::new(MethodEventType::InterpretedMethodSample, m.clone());

        let busy = StrategyContext {
            active_threads: 20,
            ..ctx(&bodies)
        };
        assert!(matches!(strategy.process_event(&event, &busy), PlanDecision::NoCompile));
        assert_eq!(m.invocation_count(), Some(20));

        // 20 / 16 rounds down to 1.
        assert!(matches!(strategy.process_event(&event, &ctx(&bodies)), PlanDecision::NoCompile));
        assert_eq!(m.invocation_count(), Some(1));
        assert!(matches!(
            strategy.process_event(&event, &ctx(&bodies)),
            PlanDecision::Compile { .. }
        ));
        assert_eq!(m.invocation_count(), Some(0));
    }

    #[test]
    fn test_interpreter_sample_respects_delay_and_sync_mode() {
        let strategy = DefaultCompilationStrategy::new(CompilationConfig::default());
        let bodies = BodyTable::new();
        let m = MethodHandle::with_count("c/C", "z", "()V", MethodFlags::default(), 0);
        let event = MethodEvent::new(MethodEventType::InterpretedMethodSample, m);
        let delayed = StrategyContext {
            compilation_delay_elapsed: false,
            ..ctx(&bodies)
        };
        assert!(matches!(strategy.process_event(&event, &delayed), PlanDecision::NoCompile));
        let sync = StrategyContext {
            async_compilation: false,
            ..ctx(&bodies)
        };
        assert!(matches!(strategy.process_event(&event, &sync), PlanDecision::NoCompile));
        assert!(matches!(
            strategy.process_event(&event, &ctx(&bodies)),
            PlanDecision::Compile { .. }
        ));
    }

    #[test]
    fn test_jitted_samples_trigger_single_upgrade() {
        let strategy = DefaultCompilationStrategy::new(CompilationConfig {
            jitted_sample_recompile_threshold: 3,
            ..CompilationConfig::default()
        });
        let bodies = BodyTable::new();
        let m = method(false);
        register(&bodies, &m, 0x200, OptLevel::Warm);
        let event = MethodEvent::new(MethodEventType::JittedMethodSample, m.clone())
            .with_old_start_pc(Some(StartPc(0x200)));
        for _ in 0..2 {
            assert!(matches!(strategy.process_event(&event, &ctx(&bodies)), PlanDecision::NoCompile));
        }
        assert_eq!(level(strategy.process_event(&event, &ctx(&bodies))), OptLevel::Hot);
        assert!(matches!(strategy.process_event(&event, &ctx(&bodies)), PlanDecision::NoCompile));
        assert_eq!(
            m.persistent_info().reason_for_recompilation(),
            RecompilationReason::Sampling
        );
    }

    #[test]
    fn test_exhausted_pool_is_out_of_memory() {
        let controller = CompilationController::with_default_strategy(&CompilationConfig {
            plan_pool_capacity: 1,
            ..CompilationConfig::default()
        });
        let bodies = BodyTable::new();
        let event = MethodEvent::new(MethodEventType::ExplicitCompilation, method(false));
        let held = controller.process_event(&event, &ctx(&bodies));
        assert!(matches!(held, PlanDecision::Compile { .. }));
        assert!(controller.process_event(&event, &ctx(&bodies)).is_out_of_memory());
        drop(held);
        assert!(matches!(
            controller.process_event(&event, &ctx(&bodies)),
            PlanDecision::Compile { .. }
        ));
        assert_eq!(controller.event_count(MethodEventType::ExplicitCompilation), 3);
        assert_eq!(controller.out_of_memory_events(), 1);
    }

    #[test]
    fn test_attached_plan_survives_exhausted_pool() {
        let controller = CompilationController::with_default_strategy(&CompilationConfig {
            plan_pool_capacity: 0,
            ..CompilationConfig::default()
        });
        let bodies = BodyTable::new();
        let m = method(false);
        register(&bodies, &m, 0x300, OptLevel::Hot);
        let attached = OptimizationPlan::new(OptLevel::Scorching).with_instrumentation();
        m.persistent_info().attach_plan(attached);
        let event = MethodEvent::new(MethodEventType::OtherRecompilationTrigger, m.clone())
            .with_old_start_pc(Some(StartPc(0x300)));

        assert!(controller.process_event(&event, &ctx(&bodies)).is_out_of_memory());
        let kept = m.persistent_info().attached_plan().unwrap();
        assert_eq!(kept.opt_level, OptLevel::Scorching);
        assert!(kept.insert_instrumentation);
    }
}
