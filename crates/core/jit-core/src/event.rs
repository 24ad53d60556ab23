//! Method events that drive compilation decisions

use crate::method::{ClassHandle, MethodHandle, StartPc};
use crate::vm::ThreadId;

/// What happened to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodEventType {
    /// Interpreter invocation count reached zero
    InterpreterCounterTripped,
    /// Compiled body asked to be recompiled (counter expiry, profiling done,
    /// inlined callee redefined)
    OtherRecompilationTrigger,
    /// Compiled body was invalidated and must be replaced before re-entry
    MethodBodyInvalidated,
    /// Allocate-and-construct thunk needed for a class
    NewInstanceImpl,
    ShareableMethodHandleThunk,
    CustomMethodHandleThunk,
    /// Sampler caught the method running in the interpreter
    InterpretedMethodSample,
    /// Sampler caught the method running compiled code
    JittedMethodSample,
    /// Dynamic loop transfer needs a compiled body
    JitCompilationInducedByDlt,
    ExplicitCompilation,
    GpuLaunch,
    ForcedRecompilationPostRestore,
}

impl MethodEventType {
    pub const ALL: [MethodEventType; 12] = [
        MethodEventType::InterpreterCounterTripped,
        MethodEventType::OtherRecompilationTrigger,
        MethodEventType::MethodBodyInvalidated,
        MethodEventType::NewInstanceImpl,
        MethodEventType::ShareableMethodHandleThunk,
        MethodEventType::CustomMethodHandleThunk,
        MethodEventType::InterpretedMethodSample,
        MethodEventType::JittedMethodSample,
        MethodEventType::JitCompilationInducedByDlt,
        MethodEventType::ExplicitCompilation,
        MethodEventType::GpuLaunch,
        MethodEventType::ForcedRecompilationPostRestore,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|t| *t == self).unwrap_or(0)
    }
}

/// A method event, created per trigger and consumed by the controller.
#[derive(Debug, Clone)]
pub struct MethodEvent {
    pub event_type: MethodEventType,
    pub method: MethodHandle,
    /// Entry point of the body being replaced, `None` for first-time compiles
    pub old_start_pc: Option<StartPc>,
    pub thread: Option<ThreadId>,
    pub class_needing_thunk: Option<ClassHandle>,
}

impl MethodEvent {
    pub fn new(event_type: MethodEventType, method: MethodHandle) -> Self {
        Self {
            event_type,
            method,
            old_start_pc: None,
            thread: None,
            class_needing_thunk: None,
        }
    }

    pub fn with_old_start_pc(mut self, old_start_pc: Option<StartPc>) -> Self {
        self.old_start_pc = old_start_pc;
        self
    }

    pub fn with_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_class(mut self, class: ClassHandle) -> Self {
        self.class_needing_thunk = Some(class);
        self
    }
}
