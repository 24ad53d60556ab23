//! The JIT runtime and its trigger entry points
//!
//! A [`JitRuntime`] is the explicit context object the VM holds. It wires
//! the controller, dispatch, caches, worker pool, sampler and (depending on
//! the remote-compilation mode) the JITServer client or server pieces, and
//! exposes the entry points the interpreter and compiled code call into.

use crate::compilation_info::{CompilationInfo, CompilationResources, DispatchOutcome};
use crate::controller::{CompilationController, CompilationStrategy, PlanDecision, StrategyContext};
use crate::cpu::{CpuUtilization, host_free_physical_memory};
use crate::profiler::{Profiler, create_profiler};
use crate::sampler::{SampleSink, SamplerMonitor, SamplerThread};
use crate::worker::CompilationThreadPool;
use jit_cache::{CacheSizing, CodeCacheManager, DataCacheManager, ReclaimStats};
use jit_core::vm::ACTIVE_COUNT_DELTA;
use jit_core::{
    ClassHandle, ClassKind, CompilationErrorCode, CompileDetails, CompileKind, JitConfig,
    JitError, JitResult, MethodCompiler, MethodEvent, MethodEventType, MethodHandle, OptLevel,
    OptimizationPlan, PlanHandle, RecompilationReason, RemoteCompilationMode, StartPc, ThreadId,
    VmServices,
};
use jit_server::protocol::flags;
use jit_server::{
    AotCache, ConnectionHandler, Connector, Listener, Metric, MetricsServer, MetricsSource,
    RemoteCompiler, ServerCompilationTask, ServerContext, StatisticsThread, TcpConnector,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Count given back to a method whose first compile is held off by the
/// compilation delay.
const DELAYED_COMPILE_COUNT: i32 = 2;

const CPU_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// State shared by the entry points and the sampler thread.
struct RuntimeCore {
    info: Arc<CompilationInfo>,
    controller: CompilationController,
    profiler: Arc<dyn Profiler>,
    cpu: Mutex<CpuUtilization>,
    assume_startup_until_told: AtomicBool,
    external_startup_ended: AtomicBool,
}

impl RuntimeCore {
    fn strategy_context(&self) -> StrategyContext<'_> {
        let config = &self.info.config().compilation;
        StrategyContext {
            bodies: self.info.bodies(),
            code_cache_almost_full: self.info.code_cache().almost_out_of_code_cache(),
            active_threads: i32::try_from(self.info.vm().thread_list().len()).unwrap_or(i32::MAX),
            startup_phase: self.info.is_startup_phase(),
            async_compilation: config.async_compilation,
            compilation_delay_elapsed: self.info.compilation_delay_elapsed(),
        }
    }

    /// Plan `event` and hand the plan to dispatch.
    fn dispatch(&self, event: &MethodEvent, details: CompileDetails, async_hint: bool) -> DispatchOutcome {
        let decision = {
            let ctx = self.strategy_context();
            self.controller.process_event(event, &ctx)
        };
        match decision {
            PlanDecision::Compile { plan, .. } => {
                self.info
                    .compile_method(event.thread, details, event.old_start_pc, async_hint, plan)
            }
            PlanDecision::NoCompile => DispatchOutcome::declined(CompilationErrorCode::Ok),
            PlanDecision::OutOfMemory
                if event.event_type == MethodEventType::MethodBodyInvalidated =>
            {
                // The invalidated body must not run again: compile the
                // cheapest body now with a plan that needs no allocation.
                let plan = PlanHandle::CallerOwned(OptimizationPlan::new(OptLevel::NoOpt));
                let outcome = self.info.compile_method(
                    event.thread,
                    details,
                    event.old_start_pc,
                    false,
                    plan,
                );
                self.info
                    .disable_further_compilation("out of memory planning an invalidated body");
                outcome
            }
            PlanDecision::OutOfMemory => DispatchOutcome::declined(CompilationErrorCode::Ok),
        }
    }

    fn update_startup_phase(&self) {
        if self.info.config().compilation.strict_startup_hints {
            return;
        }
        let startup = self.assume_startup_until_told.load(Ordering::Acquire)
            && !self.external_startup_ended.load(Ordering::Acquire);
        if startup != self.info.is_startup_phase() {
            self.info.set_startup_phase(startup);
            debug!(target: "jit::sampler", startup, "startup phase changed");
        }
    }

    /// One sampler tick: look at what every thread is running.
    fn sample(&self) {
        self.update_startup_phase();
        if let Some(percent) = self.cpu.lock().update() {
            debug!(target: "jit::perf", cpu_percent = percent, "process CPU utilization");
        }
        if !self.profiler.is_active() {
            return;
        }
        let async_compilation = self.info.config().compilation.async_compilation;
        for thread in self.info.vm().thread_list().snapshot() {
            let Some(site) = thread.execution_site() else {
                continue;
            };
            let event = match site.start_pc {
                None => {
                    self.profiler.on_interpreted_sample(&site.method);
                    MethodEvent::new(MethodEventType::InterpretedMethodSample, site.method.clone())
                }
                Some(pc) => MethodEvent::new(MethodEventType::JittedMethodSample, site.method.clone())
                    .with_old_start_pc(Some(pc)),
            }
            .with_thread(thread.id());
            let outcome = self.dispatch(
                &event,
                CompileDetails::ordinary(site.method),
                async_compilation,
            );
            if outcome.queued {
                debug!(target: "jit::sampler", method = %event.method, event = ?event.event_type, "sample triggered a compilation");
            }
        }
    }
}

struct RuntimeSampleSink {
    core: Weak<RuntimeCore>,
}

impl SampleSink for RuntimeSampleSink {
    fn on_tick(&self) {
        if let Some(core) = self.core.upgrade() {
            core.sample();
        }
    }
}

/// Hands connections accepted by the listener to the compilation queue.
struct QueueConnections {
    info: Weak<CompilationInfo>,
}

impl ConnectionHandler for QueueConnections {
    fn on_connection(&self, task: ServerCompilationTask) {
        let queued = self.info.upgrade().is_some_and(|info| info.enqueue_remote(task));
        if !queued {
            debug!(target: "jit::server", "connection dropped during shutdown");
        }
    }
}

/// Server-side services kept alive for the runtime's lifetime.
#[derive(Default)]
struct ServerServices {
    listener: Option<Listener>,
    metrics: Option<MetricsServer>,
    statistics: Option<StatisticsThread>,
}

pub struct JitRuntimeBuilder {
    config: JitConfig,
    vm: Arc<dyn VmServices>,
    compiler: Arc<dyn MethodCompiler>,
    connector: Option<Box<dyn Connector>>,
    strategy: Option<Box<dyn CompilationStrategy>>,
}

impl JitRuntimeBuilder {
    /// Transport used by a client node instead of plain TCP.
    pub fn connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn strategy(mut self, strategy: Box<dyn CompilationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn start(self) -> JitResult<JitRuntime> {
        let JitRuntimeBuilder {
            config,
            vm,
            compiler,
            connector,
            strategy,
        } = self;
        config.validate()?;
        let mode = config.remote.mode;

        let free_memory = vm.free_physical_memory().or_else(host_free_physical_memory);
        let sizing = CacheSizing::compute(&config.cache, mode, free_memory)?;
        let threads =
            sizing.cap_compilation_threads(config.compilation.compilation_threads(), mode)?;

        let remote = (mode == RemoteCompilationMode::Client).then(|| {
            let connector =
                connector.unwrap_or_else(|| Box::new(TcpConnector::new(&config.remote)));
            RemoteCompiler::new(&config.remote, connector)
        });
        let aot_cache = (mode == RemoteCompilationMode::Server && config.remote.use_aot_cache)
            .then(|| Arc::new(AotCache::new()));
        if let (Some(cache), Some(path)) = (&aot_cache, &config.remote.aot_cache_file) {
            if let Err(error) = cache.prefetch_catalog(path.clone()) {
                warn!(target: "jit::server", %error, "AOT cache prefetch thread not started");
            }
        }
        let server = (mode == RemoteCompilationMode::Server).then(|| {
            Arc::new(ServerContext::new(
                Duration::from_secs(config.remote.old_session_purge_secs),
                aot_cache.clone(),
                server_flags(&config),
            ))
        });

        let sampler_monitor = SamplerMonitor::new(config.sampler.clone());
        let info = CompilationInfo::new(
            config.clone(),
            CompilationResources {
                vm: Arc::clone(&vm),
                compiler,
                code_cache: CodeCacheManager::new(sizing),
                data_cache: DataCacheManager::new(&sizing),
                sampler: Arc::clone(&sampler_monitor),
                remote,
                server: server.clone(),
            },
        );
        let controller = match strategy {
            Some(strategy) => CompilationController::new(strategy),
            None => CompilationController::with_default_strategy(&config.compilation),
        };
        let core = Arc::new(RuntimeCore {
            info: Arc::clone(&info),
            controller,
            profiler: create_profiler(mode, Arc::clone(&vm)),
            cpu: Mutex::new(CpuUtilization::new(CPU_UPDATE_INTERVAL)),
            assume_startup_until_told: AtomicBool::new(false),
            external_startup_ended: AtomicBool::new(false),
        });

        let pool = CompilationThreadPool::start(Arc::clone(&info), threads)?;
        let sampler = if config.sampler.enabled {
            let sink = Arc::new(RuntimeSampleSink {
                core: Arc::downgrade(&core),
            });
            match SamplerThread::start(sampler_monitor, sink) {
                Ok(sampler) => Some(sampler),
                // Compilation still works through counters.
                Err(error) => {
                    warn!(target: "jit::sampler", %error, "running without a sampler thread");
                    None
                }
            }
        } else {
            None
        };

        let mut services = ServerServices::default();
        if let Some(ctx) = &server {
            services = start_server_services(&config, &info, ctx, aot_cache.as_ref())?;
        }

        info!(
            target: "jit::dispatch",
            ?mode,
            threads,
            code_cache_kb = sizing.code_cache_kb,
            max_code_caches = sizing.max_number_of_code_caches,
            "JIT runtime started"
        );
        Ok(JitRuntime {
            core,
            vm,
            pool: Mutex::new(Some(pool)),
            sampler: Mutex::new(sampler),
            services: Mutex::new(services),
            aot_cache,
            jit_control: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }
}

fn server_flags(config: &JitConfig) -> u64 {
    let mut server_flags = 0;
    if config.cache.is_64bit {
        server_flags |= flags::IS_64BIT;
    }
    if config.remote.rom_class_sharing {
        server_flags |= flags::ROM_CLASS_SHARING;
    }
    if config.remote.use_aot_cache {
        server_flags |= flags::AOT_CACHE;
    }
    server_flags
}

fn start_server_services(
    config: &JitConfig,
    info: &Arc<CompilationInfo>,
    ctx: &Arc<ServerContext>,
    aot_cache: Option<&Arc<AotCache>>,
) -> JitResult<ServerServices> {
    let listener = Listener::start(
        &config.remote,
        Arc::new(QueueConnections {
            info: Arc::downgrade(info),
        }),
    )
    .map_err(|e| JitError::Init(format!("JITServer listener: {e}")))?;

    let source: Arc<dyn MetricsSource> = {
        let ctx = Arc::clone(ctx);
        let info = Arc::downgrade(info);
        Arc::new(move || {
            let mut metrics = ctx.collect();
            if let Some(info) = info.upgrade() {
                let stats = info.stats();
                metrics.push(Metric::new(
                    "jitserver_queue_length",
                    "Entries waiting in the compilation queue",
                    stats.queue_length as f64,
                ));
                metrics.push(Metric::new(
                    "jitserver_remote_tasks_total",
                    "Server compilations taken by compilation threads",
                    stats.remote_tasks as f64,
                ));
            }
            metrics
        })
    };

    let metrics = match config.remote.metrics_port {
        Some(port) => Some(
            MetricsServer::start(port, Arc::clone(&source))
                .map_err(|e| JitError::Init(format!("JITServer metrics endpoint: {e}")))?,
        ),
        None => None,
    };
    let statistics = match config.remote.statistics_interval_secs {
        Some(secs) => match StatisticsThread::start(Duration::from_secs(secs.max(1)), source) {
            Ok(thread) => Some(thread),
            Err(error) => {
                warn!(target: "jit::perf", %error, "statistics thread not started");
                None
            }
        },
        None => None,
    };
    info!(
        target: "jit::server",
        addr = %listener.local_addr(),
        aot_cache = aot_cache.is_some(),
        "JITServer ready"
    );
    Ok(ServerServices {
        listener: Some(listener),
        metrics,
        statistics,
    })
}

/// The JIT runtime of one VM.
pub struct JitRuntime {
    core: Arc<RuntimeCore>,
    vm: Arc<dyn VmServices>,
    pool: Mutex<Option<CompilationThreadPool>>,
    sampler: Mutex<Option<SamplerThread>>,
    services: Mutex<ServerServices>,
    aot_cache: Option<Arc<AotCache>>,
    /// Serializes `disable_jit` against `enable_jit`
    jit_control: Mutex<()>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for JitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRuntime")
            .field("info", &self.core.info)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl JitRuntime {
    pub fn builder(
        config: JitConfig,
        vm: Arc<dyn VmServices>,
        compiler: Arc<dyn MethodCompiler>,
    ) -> JitRuntimeBuilder {
        JitRuntimeBuilder {
            config,
            vm,
            compiler,
            connector: None,
            strategy: None,
        }
    }

    pub fn compilation_info(&self) -> &Arc<CompilationInfo> {
        &self.core.info
    }

    pub fn controller(&self) -> &CompilationController {
        &self.core.controller
    }

    pub fn profiler(&self) -> &Arc<dyn Profiler> {
        &self.core.profiler
    }

    pub fn sampler(&self) -> &Arc<SamplerMonitor> {
        self.core.info.sampler()
    }

    pub fn aot_cache(&self) -> Option<&Arc<AotCache>> {
        self.aot_cache.as_ref()
    }

    /// Address the JITServer listener is bound to, on a server node.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.services.lock().listener.as_ref().map(Listener::local_addr)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.services.lock().metrics.as_ref().map(MetricsServer::local_addr)
    }

    pub fn cpu_utilization(&self) -> Option<u32> {
        self.core.cpu.lock().utilization()
    }

    fn async_compilation(&self) -> bool {
        self.core.info.config().compilation.async_compilation
    }

    fn is_server(&self) -> bool {
        self.core.info.mode() == RemoteCompilationMode::Server
    }

    /// The interpreter count of `method` reached zero, or compiled code at
    /// `old_start_pc` asked to be recompiled.
    pub fn compile_on_counter_trip(
        &self,
        thread: Option<ThreadId>,
        method: &MethodHandle,
        old_start_pc: Option<StartPc>,
    ) -> DispatchOutcome {
        let info = &self.core.info;
        let mut async_hint = self.async_compilation();
        let event_type = match old_start_pc {
            Some(pc) => {
                let Some(body) = info.bodies().get(pc) else {
                    return DispatchOutcome::declined(CompilationErrorCode::Ok);
                };
                if method.persistent_info().has_been_replaced() {
                    self.vm.fix_up_method_code(method);
                    body.invalidate();
                }
                if body.is_invalidated() {
                    async_hint = false;
                    MethodEventType::MethodBodyInvalidated
                } else if body.linkage().is_being_compiled() && async_hint {
                    return DispatchOutcome::declined(CompilationErrorCode::Ok);
                } else {
                    MethodEventType::OtherRecompilationTrigger
                }
            }
            None => {
                if !info.compilation_delay_elapsed() {
                    method.set_invocation_count(DELAYED_COMPILE_COUNT);
                    return DispatchOutcome::declined(CompilationErrorCode::Ok);
                }
                if self.is_server() {
                    return DispatchOutcome::declined(CompilationErrorCode::NotNeeded);
                }
                MethodEventType::InterpreterCounterTripped
            }
        };
        let mut event = MethodEvent::new(event_type, method.clone()).with_old_start_pc(old_start_pc);
        event.thread = thread;
        self.core
            .dispatch(&event, CompileDetails::ordinary(method.clone()), async_hint)
    }

    /// Compile the allocate-and-construct thunk of `class`.
    pub fn compile_new_instance_thunk(
        &self,
        thread: Option<ThreadId>,
        class: &ClassHandle,
    ) -> DispatchOutcome {
        if self.is_server() {
            return DispatchOutcome::declined(CompilationErrorCode::NotNeeded);
        }
        let details = CompileDetails::new_instance_thunk(class.clone());
        if let Some(entry) = details.method.start_pc() {
            return DispatchOutcome {
                entry: Some(entry),
                queued: false,
                error: CompilationErrorCode::Ok,
            };
        }
        let mut event = MethodEvent::new(MethodEventType::NewInstanceImpl, details.method.clone())
            .with_class(class.clone());
        event.thread = thread;
        self.core.dispatch(&event, details, self.async_compilation())
    }

    pub fn compile_method_handle_thunk(
        &self,
        thread: Option<ThreadId>,
        method: &MethodHandle,
        custom: bool,
    ) -> DispatchOutcome {
        let event_type = if custom {
            MethodEventType::CustomMethodHandleThunk
        } else {
            MethodEventType::ShareableMethodHandleThunk
        };
        let mut event = MethodEvent::new(event_type, method.clone());
        event.thread = thread;
        let details = CompileDetails {
            method: method.clone(),
            kind: CompileKind::MethodHandleThunk { custom },
        };
        self.core.dispatch(&event, details, self.async_compilation())
    }

    /// A long-running interpreted loop wants to transfer into compiled code.
    pub fn compile_induced_by_dlt(
        &self,
        thread: Option<ThreadId>,
        method: &MethodHandle,
    ) -> DispatchOutcome {
        let mut event = MethodEvent::new(MethodEventType::JitCompilationInducedByDlt, method.clone());
        event.thread = thread;
        self.core.dispatch(
            &event,
            CompileDetails::ordinary(method.clone()),
            self.async_compilation(),
        )
    }

    /// Recompile after checkpoint restore.
    pub fn force_recompilation_post_restore(&self, method: &MethodHandle) -> DispatchOutcome {
        let event = MethodEvent::new(MethodEventType::ForcedRecompilationPostRestore, method.clone())
            .with_old_start_pc(method.start_pc());
        self.core.dispatch(
            &event,
            CompileDetails::ordinary(method.clone()),
            self.async_compilation(),
        )
    }

    pub fn compile_for_gpu(&self, method: &MethodHandle) -> DispatchOutcome {
        let event = MethodEvent::new(MethodEventType::GpuLaunch, method.clone());
        self.core
            .dispatch(&event, CompileDetails::ordinary(method.clone()), false)
    }

    /// Recompile the body at `old_start_pc` for `reason`.
    pub fn retranslate_with_preparation(
        &self,
        thread: Option<ThreadId>,
        method: &MethodHandle,
        old_start_pc: StartPc,
        reason: RecompilationReason,
    ) -> DispatchOutcome {
        let attempted = self
            .core
            .info
            .bodies()
            .get(old_start_pc)
            .is_some_and(|body| body.linkage().recompilation_attempted());
        if !self.async_compilation() && !attempted {
            self.vm.fix_up_method_code(method);
        }
        method.persistent_info().set_reason_for_recompilation(reason);
        self.compile_on_counter_trip(thread, method, Some(old_start_pc))
    }

    /// Synchronously compile every compilable method of `class`.
    pub fn compile_class(&self, thread: Option<ThreadId>, class: &ClassHandle) -> bool {
        for method in class.methods() {
            let flags = method.flags();
            if flags.is_native || flags.is_abstract || flags.is_thunk || method.is_compiled() {
                continue;
            }
            let mut event = MethodEvent::new(MethodEventType::ExplicitCompilation, method.clone());
            event.thread = thread;
            let decision = {
                let ctx = self.core.strategy_context();
                self.core.controller.process_event(&event, &ctx)
            };
            match decision {
                PlanDecision::Compile { plan, .. } => {
                    let outcome = self.core.info.compile_method(
                        thread,
                        CompileDetails::ordinary(method.clone()),
                        None,
                        false,
                        plan,
                    );
                    debug!(target: "jit::dispatch", %method, error = %outcome.error, "explicit compilation");
                }
                PlanDecision::NoCompile => {}
                // No point planning the rest without memory for plans.
                PlanDecision::OutOfMemory => break,
            }
        }
        true
    }

    /// Compile every loaded class whose name contains `pattern` (dotted or
    /// slashed). Returns whether any class matched.
    pub fn compile_classes(&self, thread: Option<ThreadId>, pattern: &str) -> bool {
        let pattern = pattern.replace('.', "/");
        let mut seen = HashSet::new();
        let classes: Vec<ClassHandle> = self
            .vm
            .live_classes()
            .into_iter()
            .filter(|class| class.kind() == ClassKind::Ordinary)
            .filter(|class| class.name().contains(&pattern))
            .filter(|class| seen.insert(class.id()))
            .collect();
        info!(target: "jit::dispatch", pattern = %pattern, classes = classes.len(), "compiling classes");
        for class in &classes {
            self.compile_class(thread, class);
        }
        !classes.is_empty()
    }

    /// Startup hints from the application. Returns whether the command was
    /// recognised.
    pub fn command(&self, command: &str) -> bool {
        let strict = self.core.info.config().compilation.strict_startup_hints;
        if command.starts_with("beginningOfStartup") {
            self.core
                .assume_startup_until_told
                .store(true, Ordering::Release);
            self.core.external_startup_ended.store(false, Ordering::Release);
            if strict {
                self.core.info.set_startup_phase(true);
            }
            info!(target: "jit::perf", "command(beginningOfStartup)");
            return true;
        }
        if command.starts_with("endOfStartup") {
            // Ignored unless the application announced the startup phase.
            if self.core.assume_startup_until_told.load(Ordering::Acquire) {
                self.core.external_startup_ended.store(true, Ordering::Release);
                if strict {
                    self.core.info.set_startup_phase(false);
                }
                info!(target: "jit::perf", "command(endOfStartup)");
            }
            return true;
        }
        false
    }

    pub fn is_startup_phase(&self) -> bool {
        self.core.info.is_startup_phase()
    }

    pub fn external_startup_ended(&self) -> bool {
        self.core.external_startup_ended.load(Ordering::Acquire)
    }

    /// Stop compiling: park the compilation threads, stop profiling and the
    /// sampler, and stop the interpreter from counting. Returns `false` when
    /// the JIT was already disabled or has no compilation threads.
    pub fn disable_jit(&self) -> bool {
        let _guard = self.jit_control.lock();
        let has_workers = self
            .pool
            .lock()
            .as_ref()
            .is_some_and(|pool| pool.num_workers() > 0);
        if !has_workers || !self.core.info.suspend_compilation_threads() {
            return false;
        }
        self.core.profiler.stop();
        self.sampler().suspend();
        self.vm.thread_list().set_all_count_deltas(0);
        info!(target: "jit::dispatch", "JIT disabled");
        true
    }

    pub fn enable_jit(&self) -> bool {
        let _guard = self.jit_control.lock();
        if !self.core.info.resume_compilation_threads() {
            return false;
        }
        self.core.profiler.resume();
        self.sampler().resume();
        self.vm
            .thread_list()
            .set_all_count_deltas(ACTIVE_COUNT_DELTA);
        info!(target: "jit::dispatch", "JIT enabled");
        true
    }

    pub fn is_jit_disabled(&self) -> bool {
        self.core.info.are_compilation_threads_suspended()
    }

    /// Invalidate a compiled body; its next entry recompiles synchronously.
    pub fn invalidate_body(&self, start_pc: StartPc) -> bool {
        match self.core.info.bodies().get(start_pc) {
            Some(body) => {
                body.invalidate();
                true
            }
            None => false,
        }
    }

    /// Note that `class` was unloaded or illegally modified.
    pub fn class_unloaded(&self, class: &ClassHandle) {
        class.mark_unloaded();
        if let Some(remote) = self.core.info.remote() {
            remote.class_unloaded(class.name());
        }
    }

    /// GC end-of-cycle hook.
    pub fn on_gc_end(&self) -> ReclaimStats {
        self.core.info.on_gc_end()
    }

    /// Stop every runtime thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sampler) = self.sampler.lock().take() {
            sampler.stop();
        }
        {
            let mut services = self.services.lock();
            if let Some(mut listener) = services.listener.take() {
                listener.stop();
            }
            if let Some(mut statistics) = services.statistics.take() {
                statistics.stop();
            }
            if let Some(mut metrics) = services.metrics.take() {
                metrics.stop();
            }
        }
        if let Some(mut pool) = self.pool.lock().take() {
            pool.shutdown();
        }
        if let Some(remote) = self.core.info.remote() {
            remote.terminate_session();
        }
        if let (Some(cache), Some(path)) = (&self.aot_cache, &self.core.info.config().remote.aot_cache_file) {
            match cache.persist(path) {
                Ok(records) => info!(target: "jit::server", records, "AOT cache persisted"),
                Err(error) => warn!(target: "jit::server", %error, "AOT cache not persisted"),
            }
        }
        info!(target: "jit::dispatch", stats = ?self.core.info.stats(), "JIT runtime shut down");
    }
}

impl Drop for JitRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
