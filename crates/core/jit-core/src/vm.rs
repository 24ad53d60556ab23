//! Seams between the JIT and the hosting VM

use crate::method::{ClassHandle, MethodHandle, StartPc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Count delta applied by the interpreter while the JIT is active.
pub const ACTIVE_COUNT_DELTA: i32 = 2;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

/// Where a thread is currently executing, as seen by the sampler.
#[derive(Debug, Clone)]
pub struct ExecutionSite {
    pub method: MethodHandle,
    /// Entry of the compiled body being run, `None` when interpreting
    pub start_pc: Option<StartPc>,
}

/// VM-side state of an application thread relevant to the JIT.
#[derive(Debug)]
pub struct VmThread {
    id: ThreadId,
    name: String,
    jit_count_delta: AtomicI32,
    site: Mutex<Option<ExecutionSite>>,
}

impl VmThread {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            jit_count_delta: AtomicI32::new(ACTIVE_COUNT_DELTA),
            site: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Amount the interpreter subtracts from invocation counts. Zero while
    /// the JIT is disabled.
    pub fn jit_count_delta(&self) -> i32 {
        self.jit_count_delta.load(Ordering::Acquire)
    }

    pub fn set_jit_count_delta(&self, delta: i32) {
        self.jit_count_delta.store(delta, Ordering::Release);
    }

    pub fn execution_site(&self) -> Option<ExecutionSite> {
        self.site.lock().clone()
    }

    pub fn set_execution_site(&self, site: Option<ExecutionSite>) {
        *self.site.lock() = site;
    }
}

/// All application threads. The list mutex serializes count-delta updates.
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: Mutex<Vec<Arc<VmThread>>>,
}

impl ThreadList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, thread: Arc<VmThread>) {
        self.threads.lock().push(thread);
    }

    pub fn detach(&self, id: ThreadId) {
        self.threads.lock().retain(|t| t.id() != id);
    }

    pub fn snapshot(&self) -> Vec<Arc<VmThread>> {
        self.threads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Set the count delta of every thread while holding the list lock.
    pub fn set_all_count_deltas(&self, delta: i32) {
        for thread in self.threads.lock().iter() {
            thread.set_jit_count_delta(delta);
        }
    }
}

/// Services the JIT needs from the hosting VM.
pub trait VmServices: Send + Sync {
    fn thread_list(&self) -> &ThreadList;

    /// Classes currently loaded.
    fn live_classes(&self) -> Vec<ClassHandle>;

    /// Entry points of compiled bodies referenced from any live stack frame.
    fn active_start_pcs(&self) -> HashSet<StartPc> {
        self.thread_list()
            .snapshot()
            .iter()
            .filter_map(|t| t.execution_site().and_then(|site| site.start_pc))
            .collect()
    }

    /// Free physical memory, if the platform can tell.
    fn free_physical_memory(&self) -> Option<u64> {
        None
    }

    /// Patch a redefined method's code so that it re-enters the interpreter.
    fn fix_up_method_code(&self, method: &MethodHandle) {
        method.revert_to_interpreted(0);
        method.persistent_info().set_has_been_replaced(false);
    }

    fn stop_interpreter_profiling(&self) {}

    fn resume_interpreter_profiling(&self) {}
}

/// Minimal in-process VM used by embedders without their own class model and
/// by tests.
#[derive(Debug, Default)]
pub struct SimpleVm {
    threads: ThreadList,
    classes: Mutex<Vec<ClassHandle>>,
    free_memory: Mutex<Option<u64>>,
}

impl SimpleVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_class(&self, class: ClassHandle) {
        self.classes.lock().push(class);
    }

    /// Unload a class; its methods become reclaimable.
    pub fn unload_class(&self, class: &ClassHandle) {
        class.mark_unloaded();
        self.classes.lock().retain(|c| c != class);
    }

    pub fn set_free_physical_memory(&self, bytes: Option<u64>) {
        *self.free_memory.lock() = bytes;
    }
}

impl VmServices for SimpleVm {
    fn thread_list(&self) -> &ThreadList {
        &self.threads
    }

    fn live_classes(&self) -> Vec<ClassHandle> {
        self.classes.lock().clone()
    }

    fn free_physical_memory(&self) -> Option<u64> {
        *self.free_memory.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodFlags;

    #[test]
    fn test_count_delta_applies_to_all() {
        let list = ThreadList::new();
        let a = VmThread::new("main");
        let b = VmThread::new("worker");
        list.attach(Arc::clone(&a));
        list.attach(Arc::clone(&b));
        list.set_all_count_deltas(0);
        assert_eq!(a.jit_count_delta(), 0);
        assert_eq!(b.jit_count_delta(), 0);
        list.detach(a.id());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_active_start_pcs_from_sites() {
        let vm = SimpleVm::new();
        let thread = VmThread::new("main");
        let method = MethodHandle::new("A", "f", "()V", MethodFlags::default());
        thread.set_execution_site(Some(ExecutionSite {
            method,
            start_pc: Some(StartPc(0x80)),
        }));
        vm.thread_list().attach(thread);
        assert!(vm.active_start_pcs().contains(&StartPc(0x80)));
    }
}
