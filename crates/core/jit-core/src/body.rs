//! Metadata attached to compiled method bodies

use crate::hotness::OptLevel;
use crate::method::{MethodHandle, MethodId, StartPc};
use crate::plan::OptimizationPlan;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Why an existing body is being recompiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecompilationReason {
    #[default]
    Unknown,
    /// Sampling found the body hot
    Sampling,
    /// Body counter expired
    Counting,
    /// Recompiled because an inlined callee was redefined
    InlinedMethodRedefinition,
    /// Profiling body collected enough data
    JProfiling,
    /// Forced after checkpoint restore
    ForcedPostRestore,
    /// Body invalidated by an assumption failure
    Invalidation,
}

/// Linkage words of a compiled body.
#[derive(Debug, Default)]
pub struct LinkageInfo {
    being_compiled: AtomicBool,
    recompilation_attempted: AtomicBool,
}

impl LinkageInfo {
    pub fn is_being_compiled(&self) -> bool {
        self.being_compiled.load(Ordering::Acquire)
    }

    pub fn set_being_compiled(&self, value: bool) {
        self.being_compiled.store(value, Ordering::Release);
    }

    /// Claim the body for recompilation. Returns `false` if another thread
    /// already did.
    pub fn try_mark_being_compiled(&self) -> bool {
        self.being_compiled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn recompilation_attempted(&self) -> bool {
        self.recompilation_attempted.load(Ordering::Acquire)
    }

    pub fn set_recompilation_attempted(&self) {
        self.recompilation_attempted.store(true, Ordering::Release);
    }
}

/// Per-method data that survives across bodies.
#[derive(Debug, Default)]
pub struct PersistentMethodInfo {
    reason: Mutex<RecompilationReason>,
    has_been_replaced: AtomicBool,
    num_invalidations: AtomicU32,
    attached_plan: Mutex<Option<OptimizationPlan>>,
}

impl PersistentMethodInfo {
    pub fn reason_for_recompilation(&self) -> RecompilationReason {
        *self.reason.lock()
    }

    pub fn set_reason_for_recompilation(&self, reason: RecompilationReason) {
        *self.reason.lock() = reason;
    }

    /// Set when the method was redefined; its code must be fixed up before
    /// any recompilation.
    pub fn has_been_replaced(&self) -> bool {
        self.has_been_replaced.load(Ordering::Acquire)
    }

    pub fn set_has_been_replaced(&self, value: bool) {
        self.has_been_replaced.store(value, Ordering::Release);
    }

    pub fn num_invalidations(&self) -> u32 {
        self.num_invalidations.load(Ordering::Acquire)
    }

    pub fn increment_invalidations(&self) -> u32 {
        self.num_invalidations.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Plan to use for the next recompilation, set by a synchronous
    /// recompilation request.
    pub fn attach_plan(&self, plan: OptimizationPlan) {
        *self.attached_plan.lock() = Some(plan);
    }

    pub fn attached_plan(&self) -> Option<OptimizationPlan> {
        self.attached_plan.lock().clone()
    }

    pub fn take_attached_plan(&self) -> Option<OptimizationPlan> {
        self.attached_plan.lock().take()
    }
}

/// Description of a body produced by a successful compilation.
#[derive(Debug, Clone)]
pub struct BodyDescriptor {
    pub start_pc: StartPc,
    pub hotness: OptLevel,
    pub is_profiling_body: bool,
    pub uses_sampling: bool,
    pub code_cache_id: usize,
    pub code_size: usize,
    pub data_size: usize,
}

/// Metadata of one compiled body.
#[derive(Debug)]
pub struct JittedBodyInfo {
    method: MethodHandle,
    descriptor: BodyDescriptor,
    linkage: LinkageInfo,
    invalidated: AtomicBool,
    obsolete: AtomicBool,
    sample_count: AtomicU32,
}

impl JittedBodyInfo {
    pub fn new(method: MethodHandle, descriptor: BodyDescriptor) -> Self {
        Self {
            method,
            descriptor,
            linkage: LinkageInfo::default(),
            invalidated: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
            sample_count: AtomicU32::new(0),
        }
    }

    pub fn method(&self) -> &MethodHandle {
        &self.method
    }

    pub fn start_pc(&self) -> StartPc {
        self.descriptor.start_pc
    }

    pub fn hotness(&self) -> OptLevel {
        self.descriptor.hotness
    }

    pub fn is_profiling_body(&self) -> bool {
        self.descriptor.is_profiling_body
    }

    pub fn uses_sampling(&self) -> bool {
        self.descriptor.uses_sampling
    }

    pub fn descriptor(&self) -> &BodyDescriptor {
        &self.descriptor
    }

    pub fn linkage(&self) -> &LinkageInfo {
        &self.linkage
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Invalidate the body. Invalidated bodies are recompiled synchronously
    /// the next time they are entered.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        self.method
            .persistent_info()
            .set_reason_for_recompilation(RecompilationReason::Invalidation);
    }

    /// Superseded by a newer body of the same method.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn record_sample(&self) -> u32 {
        self.sample_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count.load(Ordering::Acquire)
    }
}

/// All compiled bodies, keyed by entry point.
#[derive(Debug, Default)]
pub struct BodyTable {
    bodies: RwLock<HashMap<StartPc, Arc<JittedBodyInfo>>>,
}

impl BodyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, body: JittedBodyInfo) -> Arc<JittedBodyInfo> {
        let body = Arc::new(body);
        self.bodies.write().insert(body.start_pc(), Arc::clone(&body));
        body
    }

    pub fn get(&self, start_pc: StartPc) -> Option<Arc<JittedBodyInfo>> {
        self.bodies.read().get(&start_pc).cloned()
    }

    pub fn remove(&self, start_pc: StartPc) -> Option<Arc<JittedBodyInfo>> {
        self.bodies.write().remove(&start_pc)
    }

    pub fn bodies_of(&self, method: MethodId) -> Vec<Arc<JittedBodyInfo>> {
        self.bodies
            .read()
            .values()
            .filter(|body| body.method().id() == method)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<JittedBodyInfo>> {
        self.bodies.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bodies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodFlags;

    fn descriptor(pc: u64) -> BodyDescriptor {
        BodyDescriptor {
            start_pc: StartPc(pc),
            hotness: OptLevel::Warm,
            is_profiling_body: false,
            uses_sampling: true,
            code_cache_id: 0,
            code_size: 256,
            data_size: 64,
        }
    }

    #[test]
    fn test_linkage_claim_is_exclusive() {
        let linkage = LinkageInfo::default();
        assert!(linkage.try_mark_being_compiled());
        assert!(!linkage.try_mark_being_compiled());
        linkage.set_being_compiled(false);
        assert!(linkage.try_mark_being_compiled());
    }

    #[test]
    fn test_invalidate_sets_reason() {
        let method = MethodHandle::new("A", "f", "()V", MethodFlags::default());
        let table = BodyTable::new();
        let body = table.register(JittedBodyInfo::new(method.clone(), descriptor(0x100)));
        body.invalidate();
        assert!(table.get(StartPc(0x100)).unwrap().is_invalidated());
        assert_eq!(
            method.persistent_info().reason_for_recompilation(),
            RecompilationReason::Invalidation
        );
        assert_eq!(table.bodies_of(method.id()).len(), 1);
    }

    #[test]
    fn test_attached_plan_take() {
        let info = PersistentMethodInfo::default();
        info.attach_plan(OptimizationPlan::new(OptLevel::Scorching));
        assert_eq!(info.attached_plan().unwrap().opt_level, OptLevel::Scorching);
        assert!(info.take_attached_plan().is_some());
        assert!(info.attached_plan().is_none());
        assert_eq!(info.increment_invalidations(), 1);
    }
}
