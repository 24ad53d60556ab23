//! Compilation dispatch for the JIT runtime
//!
//! This crate decides what gets compiled, when, and by whom:
//! - [`controller`]: turns method events into optimization plans
//! - [`compilation_info`]: the dispatch core with its queue, request
//!   deduplication and code/data cache admission
//! - [`worker`]: compilation threads and the diagnostic thread
//! - [`sampler`]: the sampler state machine and its thread
//! - [`runtime`]: [`JitRuntime`], the context object holding all of the
//!   above together with the trigger entry points the VM calls
//!
//! On a JITServer client the compilation threads offload to the server
//! through [`jit_server::RemoteCompiler`]; on a server they also serve
//! connections handed over by the listener.

pub mod compilation_info;
pub mod controller;
pub mod cpu;
pub mod profiler;
pub mod queue;
pub mod runtime;
pub mod sampler;
pub mod worker;

pub use compilation_info::{
    CompilationInfo, CompilationResources, DiagnosticRequest, DispatchOutcome,
    DispatchStatsSnapshot,
};
pub use controller::{
    CompilationController, CompilationStrategy, DefaultCompilationStrategy, PlanDecision,
    StrategyContext,
};
pub use cpu::{CpuUtilization, host_free_physical_memory};
pub use profiler::{ClientProfiler, LocalProfiler, Profiler, ServerProfiler, create_profiler};
pub use queue::{CompletionResult, RequestKey};
pub use runtime::{JitRuntime, JitRuntimeBuilder};
pub use sampler::{
    IllegalTransition, SampleSink, SamplerLifetime, SamplerMonitor, SamplerThread, SamplingState,
};
pub use worker::CompilationThreadPool;
