//! Core types of the JIT compilation-dispatch runtime
//!
//! This crate holds the vocabulary shared by the cache, remote-compilation
//! and control crates:
//! - method events and the optimization plans derived from them
//! - compilation outcome codes
//! - method, class and compiled-body metadata
//! - configuration
//! - the seams to the hosting VM and to the optimizing compiler

pub mod body;
pub mod compiler;
pub mod config;
pub mod error;
pub mod event;
pub mod hotness;
pub mod method;
pub mod plan;
pub mod vm;

pub use body::{
    BodyDescriptor, BodyTable, JittedBodyInfo, LinkageInfo, PersistentMethodInfo,
    RecompilationReason,
};
pub use compiler::{
    CompileDetails, CompileKind, CompileRequest, CompiledCode, MethodCompiler, SizeModelCompiler,
};
pub use config::{
    CacheConfig, CompilationConfig, JitConfig, RemoteCompilationMode, RemoteConfig, SamplerConfig,
    TlsConfig,
};
pub use error::{CompilationErrorCode, ConfigError, JitError, JitResult};
pub use event::{MethodEvent, MethodEventType};
pub use hotness::OptLevel;
pub use method::{
    ClassHandle, ClassId, ClassKind, MethodFlags, MethodHandle, MethodId, MethodState, StartPc,
};
pub use plan::{OptimizationPlan, PlanHandle, PlanPool, PooledPlan};
pub use vm::{ExecutionSite, SimpleVm, ThreadId, ThreadList, VmServices, VmThread};
