//! Compilation threads and the diagnostic thread

use crate::compilation_info::{CompilationInfo, DiagnosticRequest};
use crate::queue::{CompletionResult, MethodRequest, WorkItem};
use jit_core::{CompilationErrorCode, CompileRequest, CompiledCode, JitError};
use jit_server::ServerCompilationTask;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Worker threads plus the diagnostic thread.
#[derive(Debug)]
pub struct CompilationThreadPool {
    info: Arc<CompilationInfo>,
    workers: Vec<JoinHandle<()>>,
    diagnostic: Option<JoinHandle<()>>,
}

impl CompilationThreadPool {
    pub fn start(info: Arc<CompilationInfo>, threads: usize) -> Result<Self, JitError> {
        let mut pool = Self {
            info: Arc::clone(&info),
            workers: Vec::with_capacity(threads),
            diagnostic: None,
        };
        for id in 0..threads {
            let worker_info = Arc::clone(&info);
            let handle = std::thread::Builder::new()
                .name(format!("jit-compile-{id}"))
                .spawn(move || worker_loop(&worker_info, id))
                .map_err(|e| JitError::WorkerStart {
                    id,
                    reason: e.to_string(),
                });
            match handle {
                Ok(handle) => pool.workers.push(handle),
                Err(error) => {
                    pool.shutdown();
                    return Err(error);
                }
            }
        }
        if info.config().compilation.enable_diagnostic_thread {
            let diag_info = Arc::clone(&info);
            let handle = std::thread::Builder::new()
                .name("jit-diagnostic".to_string())
                .spawn(move || diagnostic_loop(&diag_info));
            match handle {
                Ok(handle) => pool.diagnostic = Some(handle),
                // Compilation works without it.
                Err(error) => warn!(target: "jit::dispatch", %error, "diagnostic thread not started"),
            }
        }
        info!(target: "jit::dispatch", threads, "compilation threads started");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn has_diagnostic_thread(&self) -> bool {
        self.diagnostic.is_some()
    }

    /// Stop every thread, failing queued requests with `Interrupted`.
    pub fn shutdown(&mut self) {
        self.info.begin_shutdown();
        for handle in self.workers.drain(..).chain(self.diagnostic.take()) {
            if handle.join().is_err() {
                warn!(target: "jit::dispatch", "compilation thread panicked");
            }
        }
    }
}

impl Drop for CompilationThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(info: &CompilationInfo, id: usize) {
    debug!(target: "jit::dispatch", id, "compilation thread running");
    while let Some(item) = info.next_work() {
        match item {
            WorkItem::Method(request) => process_method(info, request),
            WorkItem::Remote(task) => serve_remote(info, task),
        }
    }
    debug!(target: "jit::dispatch", id, "compilation thread exiting");
}

fn process_method(info: &CompilationInfo, mut request: MethodRequest) {
    let waited = request.queued_at.elapsed();
    let result = match compile(info, &request) {
        Ok(code) => match info.install(
            &request.details,
            request.plan.plan(),
            request.old_start_pc,
            &code,
        ) {
            Ok(entry) => CompletionResult {
                entry: Some(entry),
                error: CompilationErrorCode::Ok,
            },
            Err(error) => CompletionResult { entry: None, error },
        },
        Err(error) => {
            warn!(
                target: "jit::dispatch",
                method = %request.details.method,
                level = %request.plan.plan().opt_level,
                %error,
                "compilation failed"
            );
            if !error.is_stream_failure() {
                info.request_diagnostic_recompile(DiagnosticRequest {
                    details: request.details.clone(),
                    plan: request.plan.plan().clone(),
                    old_start_pc: request.old_start_pc,
                    original_error: error,
                });
            }
            CompletionResult { entry: None, error }
        }
    };
    request.plan.plan_mut().result = Some(result.error);
    debug!(
        target: "jit::perf",
        method = %request.details.method,
        waited_us = waited.as_micros() as u64,
        total_us = request.queued_at.elapsed().as_micros() as u64,
        error = %result.error,
        "request finished"
    );
    info.complete_request(&request, result);
    info.sampler().record_activity();
}

/// Run the compiler, remotely when this node is a client.
fn compile(info: &CompilationInfo, request: &MethodRequest) -> Result<CompiledCode, CompilationErrorCode> {
    let compile_request = CompileRequest {
        details: &request.details,
        plan: request.plan.plan(),
        old_start_pc: request.old_start_pc,
        trace: false,
    };
    let Some(remote) = info.remote() else {
        return info.compiler().compile(&compile_request);
    };

    let mut outcome = remote.compile(&compile_request);
    if outcome == Err(CompilationErrorCode::AotDeserializerReset) {
        // The server restarted; the deserializer is clean now.
        outcome = remote.compile(&compile_request);
    }
    match outcome {
        Ok(remote_code) => {
            debug!(
                target: "jit::server",
                method = %request.details.method,
                from_aot_cache = remote_code.from_aot_cache,
                "remote compilation returned"
            );
            Ok(remote_code.code)
        }
        Err(error) if error.is_stream_failure() && info.config().remote.local_fallback => {
            info!(
                target: "jit::server",
                method = %request.details.method,
                %error,
                "server unreachable, compiling locally"
            );
            info.compiler().compile(&compile_request)
        }
        Err(error) => Err(error),
    }
}

fn serve_remote(info: &CompilationInfo, task: ServerCompilationTask) {
    info.note_remote_task();
    let Some(ctx) = info.server() else {
        warn!(target: "jit::server", peer = ?task.peer(), "remote request on a node that is not a server");
        return;
    };
    let peer = task.peer();
    let outcome = task.run(ctx, &**info.compiler());
    debug!(target: "jit::server", ?peer, ?outcome, "server compilation finished");
}

fn diagnostic_loop(info: &CompilationInfo) {
    while let Some(request) = info.next_diagnostic() {
        let compile_request = CompileRequest {
            details: &request.details,
            plan: &request.plan,
            old_start_pc: request.old_start_pc,
            trace: true,
        };
        let result = info.compiler().compile(&compile_request);
        info.note_diagnostic_run();
        match result {
            Ok(code) => info!(
                target: "jit::dispatch",
                method = %request.details.method,
                original = %request.original_error,
                warm_size = code.warm_size,
                "traced recompilation succeeded"
            ),
            Err(error) => warn!(
                target: "jit::dispatch",
                method = %request.details.method,
                original = %request.original_error,
                %error,
                "traced recompilation failed"
            ),
        }
    }
}
