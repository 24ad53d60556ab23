//! Compilation dispatch
//!
//! [`CompilationInfo`] is the per-runtime context every trigger goes
//! through. It applies the admission policy, de-duplicates requests per
//! `(method, old body)`, feeds the worker queue, and owns the caches that
//! finished compilations are installed into.

use crate::queue::{
    CompilationQueue, Completion, CompletionResult, MethodRequest, RequestKey, WorkItem,
};
use crate::sampler::SamplerMonitor;
use jit_cache::{CodeCacheManager, DataAllocation, DataCacheManager, ReclaimSource, ReclaimStats};
use jit_core::{
    BodyDescriptor, BodyTable, CompilationErrorCode, CompileDetails, CompiledCode, JitConfig,
    JittedBodyInfo, MethodCompiler, OptLevel, OptimizationPlan, PlanHandle, RemoteCompilationMode,
    StartPc, ThreadId, VmServices,
};
use jit_server::{RemoteCompiler, ServerCompilationTask, ServerContext};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Result of one `compile_method` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Installed entry point, only for synchronous compiles that succeeded
    pub entry: Option<StartPc>,
    /// The request was handed to a compilation thread and the caller did not
    /// wait for it
    pub queued: bool,
    pub error: CompilationErrorCode,
}

impl DispatchOutcome {
    pub fn declined(error: CompilationErrorCode) -> Self {
        Self {
            entry: None,
            queued: false,
            error,
        }
    }

    fn queued() -> Self {
        Self {
            entry: None,
            queued: true,
            error: CompilationErrorCode::Ok,
        }
    }

    fn finished(result: CompletionResult) -> Self {
        Self {
            entry: result.entry,
            queued: false,
            error: result.error,
        }
    }
}

/// Dispatch counters.
#[derive(Debug, Default)]
struct DispatchStats {
    requests: AtomicU64,
    queued: AtomicU64,
    deduplicated: AtomicU64,
    declined: AtomicU64,
    compiled: AtomicU64,
    failed: AtomicU64,
    remote_tasks: AtomicU64,
    diagnostic_runs: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub requests: u64,
    pub queued: u64,
    pub deduplicated: u64,
    pub declined: u64,
    pub compiled: u64,
    pub failed: u64,
    pub remote_tasks: u64,
    pub diagnostic_runs: u64,
    pub queue_length: usize,
    pub queue_peak: usize,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) queue: CompilationQueue,
    pub(crate) in_flight: HashMap<RequestKey, Arc<Completion>>,
    pub(crate) suspended: bool,
    pub(crate) shutting_down: bool,
}

/// Failed compile queued for a traced re-run.
#[derive(Debug, Clone)]
pub struct DiagnosticRequest {
    pub details: CompileDetails,
    pub plan: OptimizationPlan,
    pub old_start_pc: Option<StartPc>,
    pub original_error: CompilationErrorCode,
}

#[derive(Debug, Default)]
pub(crate) struct DiagnosticQueue {
    pub(crate) pending: VecDeque<DiagnosticRequest>,
    pub(crate) shutting_down: bool,
}

/// Everything [`CompilationInfo`] is built from besides configuration.
pub struct CompilationResources {
    pub vm: Arc<dyn VmServices>,
    pub compiler: Arc<dyn MethodCompiler>,
    pub code_cache: Arc<CodeCacheManager>,
    pub data_cache: DataCacheManager,
    pub sampler: Arc<SamplerMonitor>,
    pub remote: Option<RemoteCompiler>,
    pub server: Option<Arc<ServerContext>>,
}

pub struct CompilationInfo {
    config: JitConfig,
    started: Instant,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) work_available: Condvar,
    pub(crate) diagnostics: Mutex<DiagnosticQueue>,
    pub(crate) diagnostic_available: Condvar,
    disable_further_compilation: AtomicBool,
    startup_phase: AtomicBool,
    vm: Arc<dyn VmServices>,
    compiler: Arc<dyn MethodCompiler>,
    code_cache: Arc<CodeCacheManager>,
    data_cache: DataCacheManager,
    data_allocations: Mutex<HashMap<StartPc, DataAllocation>>,
    bodies: BodyTable,
    sampler: Arc<SamplerMonitor>,
    remote: Option<RemoteCompiler>,
    server: Option<Arc<ServerContext>>,
    stats: DispatchStats,
}

impl std::fmt::Debug for CompilationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationInfo")
            .field("mode", &self.config.remote.mode)
            .field("disabled", &self.is_compilation_disabled())
            .field("bodies", &self.bodies.len())
            .finish_non_exhaustive()
    }
}

impl CompilationInfo {
    pub fn new(config: JitConfig, resources: CompilationResources) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            state: Mutex::new(QueueState::default()),
            work_available: Condvar::new(),
            diagnostics: Mutex::new(DiagnosticQueue::default()),
            diagnostic_available: Condvar::new(),
            disable_further_compilation: AtomicBool::new(false),
            startup_phase: AtomicBool::new(false),
            vm: resources.vm,
            compiler: resources.compiler,
            code_cache: resources.code_cache,
            data_cache: resources.data_cache,
            data_allocations: Mutex::new(HashMap::new()),
            bodies: BodyTable::new(),
            sampler: resources.sampler,
            remote: resources.remote,
            server: resources.server,
            stats: DispatchStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn mode(&self) -> RemoteCompilationMode {
        self.config.remote.mode
    }

    pub fn vm(&self) -> &Arc<dyn VmServices> {
        &self.vm
    }

    pub fn compiler(&self) -> &Arc<dyn MethodCompiler> {
        &self.compiler
    }

    pub fn bodies(&self) -> &BodyTable {
        &self.bodies
    }

    pub fn code_cache(&self) -> &Arc<CodeCacheManager> {
        &self.code_cache
    }

    pub fn data_cache(&self) -> &DataCacheManager {
        &self.data_cache
    }

    pub fn sampler(&self) -> &Arc<SamplerMonitor> {
        &self.sampler
    }

    pub fn remote(&self) -> Option<&RemoteCompiler> {
        self.remote.as_ref()
    }

    pub fn server(&self) -> Option<&Arc<ServerContext>> {
        self.server.as_ref()
    }

    /// Time since the runtime came up.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// First-time compiles are allowed once the configured delay passed.
    pub fn compilation_delay_elapsed(&self) -> bool {
        self.uptime() >= Duration::from_secs(self.config.compilation.compilation_delay_time_secs)
    }

    pub fn is_startup_phase(&self) -> bool {
        self.startup_phase.load(Ordering::Acquire)
    }

    pub fn set_startup_phase(&self, startup: bool) {
        self.startup_phase.store(startup, Ordering::Release);
    }

    pub fn is_compilation_disabled(&self) -> bool {
        self.disable_further_compilation.load(Ordering::Acquire)
    }

    /// Stop accepting non-mandatory compilations for the rest of the run.
    pub fn disable_further_compilation(&self, reason: &str) {
        if !self.disable_further_compilation.swap(true, Ordering::AcqRel) {
            warn!(target: "jit::dispatch", reason, "further compilation disabled");
        }
    }

    fn is_mandatory(&self, old_start_pc: Option<StartPc>) -> bool {
        old_start_pc
            .and_then(|pc| self.bodies.get(pc))
            .is_some_and(|body| body.is_invalidated())
    }

    fn decline(&self, error: CompilationErrorCode) -> DispatchOutcome {
        self.stats.declined.fetch_add(1, Ordering::Relaxed);
        DispatchOutcome::declined(error)
    }

    /// Admit, de-duplicate and schedule one compilation.
    ///
    /// Asynchronous requests return once queued. Synchronous requests block
    /// until a compilation thread finishes and report its entry point.
    pub fn compile_method(
        &self,
        thread: Option<ThreadId>,
        details: CompileDetails,
        old_start_pc: Option<StartPc>,
        async_hint: bool,
        plan: PlanHandle,
    ) -> DispatchOutcome {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let method = details.method.clone();
        let mandatory = self.is_mandatory(old_start_pc);
        let is_async = async_hint && self.config.compilation.async_compilation && !mandatory;
        let level = plan.plan().opt_level;

        if self.mode() == RemoteCompilationMode::Server && !mandatory {
            debug!(target: "jit::dispatch", %method, "local compilation refused on a server node");
            return self.decline(CompilationErrorCode::NotNeeded);
        }
        if self.is_compilation_disabled() && !mandatory {
            trace!(target: "jit::dispatch", %method, "compilation disabled");
            return self.decline(CompilationErrorCode::NotNeeded);
        }
        if is_async
            && level < OptLevel::Hot
            && self.code_cache.is_high_occupancy()
        {
            debug!(target: "jit::codecache", %method, %level, "high code cache occupancy, request declined");
            return self.decline(CompilationErrorCode::NotNeeded);
        }

        let key: RequestKey = (method.id(), old_start_pc);
        let completion = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return self.decline(CompilationErrorCode::Interrupted);
            }
            if state.suspended && !mandatory {
                return self.decline(CompilationErrorCode::Suspended);
            }
            if let Some(existing) = state.in_flight.get(&key).cloned() {
                self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
                drop(state);
                trace!(target: "jit::dispatch", %method, is_async, "already being compiled");
                if is_async {
                    return DispatchOutcome::declined(CompilationErrorCode::Ok);
                }
                return DispatchOutcome::finished(existing.wait());
            }
            if is_async && state.queue.len() >= self.config.compilation.max_queue_size {
                drop(state);
                debug!(target: "jit::dispatch", %method, "compilation queue full");
                return self.decline(CompilationErrorCode::Ok);
            }

            if let Some(from) = self.sampler.on_compilation_request(old_start_pc.is_none()) {
                debug!(target: "jit::sampler", from = from.name(), %method, "compilation pressure woke the sampler");
            }
            if let Some(body) = old_start_pc.and_then(|pc| self.bodies.get(pc)) {
                body.linkage().set_being_compiled(true);
            }

            let completion = Completion::new();
            state.in_flight.insert(key, Arc::clone(&completion));
            state.queue.push(WorkItem::Method(MethodRequest {
                details,
                plan,
                old_start_pc,
                is_async,
                mandatory,
                completion: Arc::clone(&completion),
                queued_at: Instant::now(),
            }));
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
            self.work_available.notify_one();
            completion
        };

        debug!(target: "jit::dispatch", %method, %level, is_async, mandatory, thread = ?thread, "compilation queued");
        if is_async {
            return DispatchOutcome::queued();
        }
        DispatchOutcome::finished(completion.wait())
    }

    /// Queue a connection accepted by the server listener.
    pub fn enqueue_remote(&self, task: ServerCompilationTask) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down {
            return false;
        }
        state.queue.push(WorkItem::Remote(task));
        self.work_available.notify_one();
        true
    }

    /// Block until work is available. Suspended threads only take mandatory
    /// requests. `None` once the runtime shuts down.
    pub(crate) fn next_work(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        loop {
            if state.shutting_down {
                return None;
            }
            let item = if state.suspended {
                state.queue.pop_mandatory()
            } else {
                state.queue.pop()
            };
            if item.is_some() {
                return item;
            }
            self.work_available.wait(&mut state);
        }
    }

    /// Retire an in-flight request and wake its waiters.
    pub(crate) fn complete_request(&self, request: &MethodRequest, result: CompletionResult) {
        if let Some(body) = request.old_start_pc.and_then(|pc| self.bodies.get(pc)) {
            body.linkage().set_being_compiled(false);
        }
        if result.error.is_ok() {
            self.stats.compiled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.state.lock().in_flight.remove(&request.key());
        request.completion.complete(result);
    }

    pub(crate) fn note_remote_task(&self) {
        self.stats.remote_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_diagnostic_run(&self) {
        self.stats.diagnostic_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Carve code and metadata space for a finished compile and publish the
    /// new body.
    pub(crate) fn install(
        &self,
        details: &CompileDetails,
        plan: &OptimizationPlan,
        old_start_pc: Option<StartPc>,
        code: &CompiledCode,
    ) -> Result<StartPc, CompilationErrorCode> {
        let mut retried = false;
        let allocation = loop {
            let attempt = self
                .code_cache
                .reserve()
                .and_then(|reservation| reservation.allocate(code.warm_size, code.cold_size));
            match attempt {
                Ok(allocation) => break allocation,
                Err(error) => {
                    let code = CompilationErrorCode::from(&error);
                    if code.is_recoverable() && !retried {
                        debug!(target: "jit::codecache", %error, "retrying with a fresh reservation");
                        retried = true;
                        continue;
                    }
                    self.disable_further_compilation("code cache exhausted");
                    return Err(code);
                }
            }
        };
        let data = match self.data_cache.allocate(code.data_size) {
            Ok(data) => data,
            Err(error) => {
                self.code_cache.free_body(allocation.warm_start);
                self.disable_further_compilation("data cache exhausted");
                return Err(CompilationErrorCode::from(&error));
            }
        };

        let start_pc = allocation.warm_start;
        self.data_allocations.lock().insert(start_pc, data);
        self.bodies.register(JittedBodyInfo::new(
            details.method.clone(),
            BodyDescriptor {
                start_pc,
                hotness: plan.opt_level,
                is_profiling_body: code.is_profiling_body,
                uses_sampling: plan.use_sampling,
                code_cache_id: allocation.cache_id,
                code_size: allocation.total_size(),
                data_size: data.size,
            },
        ));
        details.method.install(start_pc);
        if let Some(old) = old_start_pc.and_then(|pc| self.bodies.get(pc)) {
            old.mark_obsolete();
        }
        info!(
            target: "jit::dispatch",
            method = %details.method,
            level = %plan.opt_level,
            start_pc = %start_pc,
            size = allocation.total_size(),
            "compiled"
        );
        Ok(start_pc)
    }

    /// Queue a traced re-run of a failed compile on the diagnostic thread.
    pub fn request_diagnostic_recompile(&self, request: DiagnosticRequest) -> bool {
        if !self.config.compilation.enable_diagnostic_thread {
            return false;
        }
        let mut diagnostics = self.diagnostics.lock();
        if diagnostics.shutting_down {
            return false;
        }
        diagnostics.pending.push_back(request);
        self.diagnostic_available.notify_one();
        true
    }

    pub(crate) fn next_diagnostic(&self) -> Option<DiagnosticRequest> {
        let mut diagnostics = self.diagnostics.lock();
        loop {
            if diagnostics.shutting_down {
                return None;
            }
            if let Some(request) = diagnostics.pending.pop_front() {
                return Some(request);
            }
            self.diagnostic_available.wait(&mut diagnostics);
        }
    }

    /// Park every compilation thread except for mandatory requests. Queued
    /// requests that are not mandatory complete with `Suspended`.
    pub fn suspend_compilation_threads(&self) -> bool {
        let (changed, cancelled) = {
            let mut state = self.state.lock();
            let changed = !state.suspended;
            state.suspended = true;
            let cancelled = state.queue.extract_if(
                |item| matches!(item, WorkItem::Method(request) if !request.mandatory),
            );
            for item in &cancelled {
                if let WorkItem::Method(request) = item {
                    state.in_flight.remove(&request.key());
                }
            }
            (changed, cancelled)
        };
        if !cancelled.is_empty() {
            debug!(target: "jit::dispatch", count = cancelled.len(), "cancelled queued compilations on suspend");
        }
        for item in cancelled {
            if let WorkItem::Method(request) = item {
                if let Some(body) = request.old_start_pc.and_then(|pc| self.bodies.get(pc)) {
                    body.linkage().set_being_compiled(false);
                }
                self.stats.declined.fetch_add(1, Ordering::Relaxed);
                request.completion.complete(CompletionResult {
                    entry: None,
                    error: CompilationErrorCode::Suspended,
                });
            }
        }
        changed
    }

    pub fn resume_compilation_threads(&self) -> bool {
        let mut state = self.state.lock();
        let changed = state.suspended;
        state.suspended = false;
        self.work_available.notify_all();
        changed
    }

    pub fn are_compilation_threads_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Whether `method`/`old_start_pc` has a compile queued or running.
    pub fn is_queued_for_compilation(&self, key: &RequestKey) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }

    pub fn queue_length(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Free every body that is dead and not on a live stack.
    pub fn on_gc_end(&self) -> ReclaimStats {
        let live = self.vm.active_start_pcs();
        let source = DeadBodies {
            bodies: &self.bodies,
            live: &live,
        };
        let stats = self.code_cache.on_gc_end(&source);
        let mut data = self.data_allocations.lock();
        for pc in &stats.freed {
            self.bodies.remove(*pc);
            if let Some(allocation) = data.remove(pc) {
                self.data_cache.free(&allocation);
            }
        }
        stats
    }

    /// Stop dispatch. Requests still queued complete with `Interrupted`.
    pub(crate) fn begin_shutdown(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            self.work_available.notify_all();
            state.in_flight.clear();
            state.queue.drain()
        };
        {
            let mut diagnostics = self.diagnostics.lock();
            diagnostics.shutting_down = true;
            diagnostics.pending.clear();
            self.diagnostic_available.notify_all();
        }
        for item in drained {
            if let WorkItem::Method(request) = item {
                request.completion.complete(CompletionResult {
                    entry: None,
                    error: CompilationErrorCode::Interrupted,
                });
            }
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        let (queue_length, queue_peak) = {
            let state = self.state.lock();
            (state.queue.len(), state.queue.peak())
        };
        DispatchStatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            deduplicated: self.stats.deduplicated.load(Ordering::Relaxed),
            declined: self.stats.declined.load(Ordering::Relaxed),
            compiled: self.stats.compiled.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            remote_tasks: self.stats.remote_tasks.load(Ordering::Relaxed),
            diagnostic_runs: self.stats.diagnostic_runs.load(Ordering::Relaxed),
            queue_length,
            queue_peak,
        }
    }
}

/// Bodies whose method was unloaded, or that were invalidated or replaced,
/// and that no thread is running.
struct DeadBodies<'a> {
    bodies: &'a BodyTable,
    live: &'a HashSet<StartPc>,
}

impl ReclaimSource for DeadBodies<'_> {
    fn is_reclaimable(&self, pc: StartPc) -> bool {
        if self.live.contains(&pc) {
            return false;
        }
        self.bodies.get(pc).is_some_and(|body| {
            body.method().is_unloaded() || body.is_invalidated() || body.is_obsolete()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jit_cache::CacheSizing;
    use jit_core::{MethodFlags, MethodHandle, SimpleVm, SizeModelCompiler};

    fn info(config: JitConfig) -> Arc<CompilationInfo> {
        let sizing = CacheSizing::compute(&config.cache, config.remote.mode, None).unwrap();
        CompilationInfo::new(
            config.clone(),
            CompilationResources {
                vm: Arc::new(SimpleVm::new()),
                compiler: Arc::new(SizeModelCompiler::default()),
                code_cache: CodeCacheManager::new(sizing),
                data_cache: DataCacheManager::new(&sizing),
                sampler: SamplerMonitor::new(config.sampler.clone()),
                remote: None,
                server: None,
            },
        )
    }

    fn plan(level: OptLevel) -> PlanHandle {
        PlanHandle::CallerOwned(OptimizationPlan::new(level))
    }

    fn method(name: &str) -> MethodHandle {
        MethodHandle::new("d/D", name, "()V", MethodFlags::default())
    }

    #[test]
    fn test_async_request_is_queued_once() {
        let info = info(JitConfig::default());
        let m = method("once");
        let first = info.compile_method(
            None,
            CompileDetails::ordinary(m.clone()),
            None,
            true,
            plan(OptLevel::Warm),
        );
        assert!(first.queued);
        let second = info.compile_method(
            None,
            CompileDetails::ordinary(m.clone()),
            None,
            true,
            plan(OptLevel::Warm),
        );
        assert_eq!(second, DispatchOutcome::declined(CompilationErrorCode::Ok));
        assert_eq!(info.queue_length(), 1);
        assert!(info.is_queued_for_compilation(&(m.id(), None)));
        assert_eq!(info.stats().deduplicated, 1);
    }

    #[test]
    fn test_server_node_refuses_local_compiles() {
        let mut config = JitConfig::default();
        config.remote.mode = RemoteCompilationMode::Server;
        let info = info(config);
        let outcome = info.compile_method(
            None,
            CompileDetails::ordinary(method("srv")),
            None,
            true,
            plan(OptLevel::Warm),
        );
        assert_eq!(outcome, DispatchOutcome::declined(CompilationErrorCode::NotNeeded));
        assert_eq!(info.queue_length(), 0);
    }

    #[test]
    fn test_suspended_and_disabled_decline() {
        let info = info(JitConfig::default());
        info.suspend_compilation_threads();
        let outcome = info.compile_method(
            None,
            CompileDetails::ordinary(method("s")),
            None,
            true,
            plan(OptLevel::Warm),
        );
        assert_eq!(outcome.error, CompilationErrorCode::Suspended);
        info.resume_compilation_threads();
        info.disable_further_compilation("test");
        let outcome = info.compile_method(
            None,
            CompileDetails::ordinary(method("d")),
            None,
            true,
            plan(OptLevel::Warm),
        );
        assert!(!outcome.queued);
        assert_eq!(info.queue_length(), 0);
    }

    #[test]
    fn test_full_queue_declines_quietly() {
        let mut config = JitConfig::default();
        config.compilation.max_queue_size = 1;
        let info = info(config);
        for (name, queued) in [("a", true), ("b", false)] {
            let outcome = info.compile_method(
                None,
                CompileDetails::ordinary(method(name)),
                None,
                true,
                plan(OptLevel::Warm),
            );
            assert_eq!(outcome.queued, queued);
            assert_eq!(outcome.error, CompilationErrorCode::Ok);
        }
    }

    #[test]
    fn test_install_registers_body_and_retires_old() {
        let info = info(JitConfig::default());
        let m = method("inst");
        let details = CompileDetails::ordinary(m.clone());
        let code = CompiledCode {
            warm_size: 256,
            cold_size: 64,
            data_size: 32,
            is_profiling_body: false,
        };
        let first = info
            .install(&details, &OptimizationPlan::new(OptLevel::Warm), None, &code)
            .unwrap();
        assert_eq!(m.start_pc(), Some(first));
        let second = info
            .install(&details, &OptimizationPlan::new(OptLevel::Hot), Some(first), &code)
            .unwrap();
        assert_eq!(m.start_pc(), Some(second));
        assert!(info.bodies().get(first).unwrap().is_obsolete());

        let reclaimed = info.on_gc_end();
        assert_eq!(reclaimed.freed, vec![first]);
        assert!(info.bodies().get(first).is_none());
        assert!(info.bodies().get(second).is_some());
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let info = info(JitConfig::default());
        let waiter = {
            let info = Arc::clone(&info);
            std::thread::spawn(move || {
                info.compile_method(
                    None,
                    CompileDetails::ordinary(method("sync")),
                    None,
                    false,
                    plan(OptLevel::Warm),
                )
            })
        };
        while info.queue_length() == 0 {
            std::thread::yield_now();
        }
        info.begin_shutdown();
        let outcome = waiter.join().unwrap();
        assert_eq!(outcome.error, CompilationErrorCode::Interrupted);
        assert_eq!(outcome.entry, None);
    }
}
