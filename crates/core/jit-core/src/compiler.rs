//! The optimizing compiler seam

use crate::error::CompilationErrorCode;
use crate::method::{ClassHandle, MethodHandle, StartPc};
use crate::plan::OptimizationPlan;
use serde::{Deserialize, Serialize};

/// What kind of body is being compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileKind {
    Ordinary,
    NewInstanceThunk(ClassHandle),
    MethodHandleThunk { custom: bool },
}

/// Method plus compile kind, as handed to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDetails {
    pub method: MethodHandle,
    pub kind: CompileKind,
}

impl CompileDetails {
    pub fn ordinary(method: MethodHandle) -> Self {
        Self {
            method,
            kind: CompileKind::Ordinary,
        }
    }

    pub fn new_instance_thunk(class: ClassHandle) -> Self {
        Self {
            method: class.new_instance_prototype(),
            kind: CompileKind::NewInstanceThunk(class),
        }
    }
}

/// Input of a single compilation.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    pub details: &'a CompileDetails,
    pub plan: &'a OptimizationPlan,
    pub old_start_pc: Option<StartPc>,
    /// Emit a detailed trace; set by the diagnostic thread
    pub trace: bool,
}

/// Sizes of the artifacts produced by the compiler. The runtime carves the
/// memory out of the code and data caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCode {
    /// Bytes placed at the warm (low) end of a code cache
    pub warm_size: usize,
    /// Bytes placed at the cold (high) end of a code cache
    pub cold_size: usize,
    /// Metadata bytes placed in the data cache
    pub data_size: usize,
    pub is_profiling_body: bool,
}

/// The optimizing compiler pipeline.
pub trait MethodCompiler: Send + Sync {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<CompiledCode, CompilationErrorCode>;
}

/// Compiler that derives code size from the plan level; used where no real
/// code generator is attached.
#[derive(Debug, Clone)]
pub struct SizeModelCompiler {
    pub base_size: usize,
}

impl Default for SizeModelCompiler {
    fn default() -> Self {
        Self { base_size: 512 }
    }
}

impl MethodCompiler for SizeModelCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<CompiledCode, CompilationErrorCode> {
        let factor = request.plan.opt_level as usize + 1;
        Ok(CompiledCode {
            warm_size: self.base_size * factor,
            cold_size: self.base_size / 4,
            data_size: self.base_size / 2,
            is_profiling_body: request.plan.insert_instrumentation,
        })
    }
}
