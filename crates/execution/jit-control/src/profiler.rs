//! Interpreter profiler variants
//!
//! One profiler is chosen at startup from the remote-compilation mode. A
//! server has no interpreter of its own; its profile data arrives with
//! client requests.

use jit_core::{MethodHandle, MethodId, RemoteCompilationMode, VmServices};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

pub trait Profiler: Send + Sync {
    fn name(&self) -> &'static str;

    /// An interpreted method was found on a sampled stack.
    fn on_interpreted_sample(&self, method: &MethodHandle);

    fn samples(&self, method: &MethodHandle) -> u64;

    /// Stop collecting (disable_jit).
    fn stop(&self);

    /// Resume collecting (enable_jit).
    fn resume(&self);

    fn is_active(&self) -> bool;
}

/// Profiler for a VM compiling in-process.
pub struct LocalProfiler {
    vm: Arc<dyn VmServices>,
    active: AtomicBool,
    samples: Mutex<HashMap<MethodId, u64>>,
}

impl LocalProfiler {
    pub fn new(vm: Arc<dyn VmServices>) -> Self {
        Self {
            vm,
            active: AtomicBool::new(true),
            samples: Mutex::new(HashMap::new()),
        }
    }
}

impl Profiler for LocalProfiler {
    fn name(&self) -> &'static str {
        "local"
    }

    fn on_interpreted_sample(&self, method: &MethodHandle) {
        if self.is_active() {
            *self.samples.lock().entry(method.id()).or_default() += 1;
        }
    }

    fn samples(&self, method: &MethodHandle) -> u64 {
        self.samples.lock().get(&method.id()).copied().unwrap_or(0)
    }

    fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.vm.stop_interpreter_profiling();
            debug!(target: "jit::sampler", "interpreter profiling stopped");
        }
    }

    fn resume(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            self.vm.resume_interpreter_profiling();
            debug!(target: "jit::sampler", "interpreter profiling resumed");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Client profiler: collects locally like [`LocalProfiler`] and counts the
/// samples that will travel to the server with later requests.
pub struct ClientProfiler {
    local: LocalProfiler,
    pending: AtomicU64,
}

impl ClientProfiler {
    pub fn new(vm: Arc<dyn VmServices>) -> Self {
        Self {
            local: LocalProfiler::new(vm),
            pending: AtomicU64::new(0),
        }
    }

    pub fn pending_samples(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }
}

impl Profiler for ClientProfiler {
    fn name(&self) -> &'static str {
        "client"
    }

    fn on_interpreted_sample(&self, method: &MethodHandle) {
        if self.local.is_active() {
            self.pending.fetch_add(1, Ordering::Relaxed);
        }
        self.local.on_interpreted_sample(method);
    }

    fn samples(&self, method: &MethodHandle) -> u64 {
        self.local.samples(method)
    }

    fn stop(&self) {
        self.local.stop();
    }

    fn resume(&self) {
        self.local.resume();
    }

    fn is_active(&self) -> bool {
        self.local.is_active()
    }
}

#[derive(Debug, Default)]
pub struct ServerProfiler;

impl Profiler for ServerProfiler {
    fn name(&self) -> &'static str {
        "server"
    }

    fn on_interpreted_sample(&self, _method: &MethodHandle) {}

    fn samples(&self, _method: &MethodHandle) -> u64 {
        0
    }

    fn stop(&self) {}

    fn resume(&self) {}

    fn is_active(&self) -> bool {
        false
    }
}

pub fn create_profiler(mode: RemoteCompilationMode, vm: Arc<dyn VmServices>) -> Arc<dyn Profiler> {
    match mode {
        RemoteCompilationMode::None => Arc::new(LocalProfiler::new(vm)),
        RemoteCompilationMode::Client => Arc::new(ClientProfiler::new(vm)),
        RemoteCompilationMode::Server => Arc::new(ServerProfiler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jit_core::{MethodFlags, SimpleVm};

    #[test]
    fn test_factory_picks_variant() {
        let vm: Arc<dyn VmServices> = Arc::new(SimpleVm::new());
        assert_eq!(create_profiler(RemoteCompilationMode::None, vm.clone()).name(), "local");
        assert_eq!(create_profiler(RemoteCompilationMode::Client, vm.clone()).name(), "client");
        assert_eq!(create_profiler(RemoteCompilationMode::Server, vm).name(), "server");
    }

    #[test]
    fn test_stopped_profiler_ignores_samples() {
        let profiler = LocalProfiler::new(Arc::new(SimpleVm::new()));
        let method = MethodHandle::new("p/P", "f", "()V", MethodFlags::default());
        profiler.on_interpreted_sample(&method);
        profiler.stop();
        profiler.on_interpreted_sample(&method);
        assert_eq!(profiler.samples(&method), 1);
        profiler.resume();
        profiler.on_interpreted_sample(&method);
        assert_eq!(profiler.samples(&method), 2);
    }
}
