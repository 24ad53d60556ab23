//! Method and class handles shared between the VM and the JIT

use crate::body::PersistentMethodInfo;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_METHOD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

/// Address of a compiled body's entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StartPc(pub u64);

impl fmt::Display for StartPc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u64);

/// Static properties of a method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    pub is_native: bool,
    pub is_abstract: bool,
    /// Archetype/thunk methods are never compiled directly
    pub is_thunk: bool,
    pub has_backward_branches: bool,
}

/// Execution state of a method as seen by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    /// Still interpreted; the count is decremented on every invocation and
    /// trips a compilation when it reaches zero.
    Interpreted { count: i32 },
    Compiled(StartPc),
}

#[derive(Debug)]
struct MethodData {
    id: MethodId,
    class_name: String,
    name: String,
    signature: String,
    flags: MethodFlags,
    state: Mutex<MethodState>,
    info: PersistentMethodInfo,
    unloaded: AtomicBool,
}

/// Shared handle to a VM method.
#[derive(Debug, Clone)]
pub struct MethodHandle(Arc<MethodData>);

impl MethodHandle {
    pub fn new(class_name: &str, name: &str, signature: &str, flags: MethodFlags) -> Self {
        Self::with_count(class_name, name, signature, flags, 1000)
    }

    pub fn with_count(
        class_name: &str,
        name: &str,
        signature: &str,
        flags: MethodFlags,
        initial_count: i32,
    ) -> Self {
        MethodHandle(Arc::new(MethodData {
            id: MethodId(NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed)),
            class_name: class_name.replace('.', "/"),
            name: name.to_string(),
            signature: signature.to_string(),
            flags,
            state: Mutex::new(MethodState::Interpreted {
                count: initial_count,
            }),
            info: PersistentMethodInfo::default(),
            unloaded: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> MethodId {
        self.0.id
    }

    pub fn class_name(&self) -> &str {
        &self.0.class_name
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn signature(&self) -> &str {
        &self.0.signature
    }

    pub fn flags(&self) -> MethodFlags {
        self.0.flags
    }

    /// Signature in `class.name(sig)` form, as used in logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.0.class_name, self.0.name, self.0.signature)
    }

    pub fn state(&self) -> MethodState {
        *self.0.state.lock()
    }

    pub fn start_pc(&self) -> Option<StartPc> {
        match self.state() {
            MethodState::Compiled(pc) => Some(pc),
            MethodState::Interpreted { .. } => None,
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.start_pc().is_some()
    }

    pub fn invocation_count(&self) -> Option<i32> {
        match self.state() {
            MethodState::Interpreted { count } => Some(count),
            MethodState::Compiled(_) => None,
        }
    }

    /// Set the interpreter count. Has no effect once the method is compiled.
    pub fn set_invocation_count(&self, count: i32) -> bool {
        let mut state = self.0.state.lock();
        match *state {
            MethodState::Interpreted { .. } => {
                *state = MethodState::Interpreted { count };
                true
            }
            MethodState::Compiled(_) => false,
        }
    }

    /// Atomically replace the interpreter count when it still equals
    /// `expected`.
    pub fn compare_and_set_count(&self, expected: i32, count: i32) -> bool {
        let mut state = self.0.state.lock();
        match *state {
            MethodState::Interpreted { count: current } if current == expected => {
                *state = MethodState::Interpreted { count };
                true
            }
            _ => false,
        }
    }

    /// Point the method at freshly installed code.
    pub fn install(&self, entry: StartPc) {
        *self.0.state.lock() = MethodState::Compiled(entry);
    }

    /// Send the method back to the interpreter (code patched out).
    pub fn revert_to_interpreted(&self, count: i32) {
        *self.0.state.lock() = MethodState::Interpreted { count };
    }

    pub fn persistent_info(&self) -> &PersistentMethodInfo {
        &self.0.info
    }

    pub fn is_unloaded(&self) -> bool {
        self.0.unloaded.load(Ordering::Acquire)
    }

    pub fn mark_unloaded(&self) {
        self.0.unloaded.store(true, Ordering::Release);
    }
}

impl PartialEq for MethodHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for MethodHandle {}

impl std::hash::Hash for MethodHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Display for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Ordinary,
    Primitive,
    Array,
}

#[derive(Debug)]
struct ClassData {
    id: ClassId,
    name: String,
    kind: ClassKind,
    methods: RwLock<Vec<MethodHandle>>,
    new_instance_prototype: OnceLock<MethodHandle>,
    unloaded: AtomicBool,
}

/// Shared handle to a loaded class.
#[derive(Debug, Clone)]
pub struct ClassHandle(Arc<ClassData>);

impl ClassHandle {
    /// Create a class. Dotted names are stored in internal slash form.
    pub fn new(name: &str, kind: ClassKind) -> Self {
        ClassHandle(Arc::new(ClassData {
            id: ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.replace('.', "/"),
            kind,
            methods: RwLock::new(Vec::new()),
            new_instance_prototype: OnceLock::new(),
            unloaded: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ClassId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> ClassKind {
        self.0.kind
    }

    pub fn add_method(&self, name: &str, signature: &str, flags: MethodFlags) -> MethodHandle {
        let method = MethodHandle::new(&self.0.name, name, signature, flags);
        self.0.methods.write().push(method.clone());
        method
    }

    pub fn methods(&self) -> Vec<MethodHandle> {
        self.0.methods.read().clone()
    }

    /// Synthetic method whose compiled body serves as the class's
    /// allocate-and-construct thunk.
    pub fn new_instance_prototype(&self) -> MethodHandle {
        self.0
            .new_instance_prototype
            .get_or_init(|| {
                MethodHandle::new(
                    &self.0.name,
                    "newInstancePrototype",
                    "()Ljava/lang/Object;",
                    MethodFlags::default(),
                )
            })
            .clone()
    }

    pub fn is_unloaded(&self) -> bool {
        self.0.unloaded.load(Ordering::Acquire)
    }

    /// Mark the class and all of its methods unloaded.
    pub fn mark_unloaded(&self) {
        self.0.unloaded.store(true, Ordering::Release);
        for method in self.0.methods.read().iter() {
            method.mark_unloaded();
        }
        if let Some(prototype) = self.0.new_instance_prototype.get() {
            prototype.mark_unloaded();
        }
    }
}

impl PartialEq for ClassHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ClassHandle {}

impl std::hash::Hash for ClassHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_and_install() {
        let method = MethodHandle::with_count("a.B", "run", "()V", MethodFlags::default(), 5);
        assert_eq!(method.class_name(), "a/B");
        assert_eq!(method.invocation_count(), Some(5));
        assert!(method.compare_and_set_count(5, 2));
        assert!(!method.compare_and_set_count(5, 1));

        method.install(StartPc(0x4000));
        assert_eq!(method.start_pc(), Some(StartPc(0x4000)));
        assert!(!method.set_invocation_count(3));

        method.revert_to_interpreted(2);
        assert_eq!(method.invocation_count(), Some(2));
    }

    #[test]
    fn test_class_unload_marks_methods() {
        let class = ClassHandle::new("java.util.List", ClassKind::Ordinary);
        let m = class.add_method("size", "()I", MethodFlags::default());
        let proto = class.new_instance_prototype();
        assert_eq!(class.name(), "java/util/List");
        class.mark_unloaded();
        assert!(m.is_unloaded());
        assert!(proto.is_unloaded());
        assert_eq!(class.new_instance_prototype(), proto);
    }
}
