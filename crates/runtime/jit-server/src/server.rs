//! Server side of a remote compilation
//!
//! A [`ServerCompilationTask`] owns one accepted connection. It is executed
//! by a compilation thread: it performs the version handshake, applies the
//! client's class-unload updates in sequence order, serves the request from
//! the shared AOT cache when possible and compiles otherwise.

use crate::aot_cache::{AotCache, AotKey};
use crate::protocol::{
    ClientHello, CompilationFailure, CompilationRequest, CompilationResponse, ErrorMessage,
    MessageType, ProtocolVersion, ServerHello, SessionTerminate, flags,
};
use crate::session::{ClientSessionHT, SequenceError};
use crate::stream::{MessageStream, StreamError};
use jit_core::{CompilationErrorCode, CompileDetails, CompileRequest, MethodCompiler, OptLevel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests: AtomicU64,
    pub compiled: AtomicU64,
    pub failed: AtomicU64,
    pub aot_hits: AtomicU64,
    pub stream_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub requests: u64,
    pub compiled: u64,
    pub failed: u64,
    pub aot_hits: u64,
    pub stream_errors: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            compiled: self.compiled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aot_hits: self.aot_hits.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every server compilation.
#[derive(Debug)]
pub struct ServerContext {
    pub sessions: ClientSessionHT,
    pub aot_cache: Option<Arc<AotCache>>,
    pub server_uid: u64,
    pub flags: u64,
    /// How long an early request waits for its predecessors
    pub sequence_timeout: Duration,
    pub stats: ServerStats,
}

impl ServerContext {
    pub fn new(old_session_age: Duration, aot_cache: Option<Arc<AotCache>>, flags: u64) -> Self {
        Self {
            sessions: ClientSessionHT::new(old_session_age),
            aot_cache,
            server_uid: Uuid::new_v4().as_u64_pair().0,
            flags,
            sequence_timeout: Duration::from_secs(30),
            stats: ServerStats::default(),
        }
    }
}

/// How a server compilation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Compiled {
        client: Uuid,
        method: String,
        level: OptLevel,
        from_aot_cache: bool,
    },
    /// The request was answered with a failure code
    Failed(CompilationErrorCode),
    /// Client closed the connection without a request
    ConnectionTerminated,
    SessionTerminated(Uuid),
    /// Transport broke; the stream was dropped
    Aborted(CompilationErrorCode),
}

#[derive(Debug)]
pub struct ServerCompilationTask {
    stream: MessageStream,
    peer: Option<SocketAddr>,
}

impl ServerCompilationTask {
    pub fn new(stream: MessageStream, peer: Option<SocketAddr>) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn run(mut self, ctx: &ServerContext, compiler: &dyn MethodCompiler) -> TaskOutcome {
        match self.serve(ctx, compiler) {
            Ok(outcome) => outcome,
            Err(error) => self.on_stream_error(ctx, error),
        }
    }

    fn on_stream_error(&mut self, ctx: &ServerContext, error: StreamError) -> TaskOutcome {
        ctx.stats.stream_errors.fetch_add(1, Ordering::Relaxed);
        let code = CompilationErrorCode::from(&error);
        match error {
            StreamError::VersionIncompatible { .. }
            | StreamError::TypeMismatch { .. }
            | StreamError::UnknownMessageType(_) => {
                warn!(target: "jit::server", peer = ?self.peer, %error, "rejecting client");
                let _ = self.stream.write_message(
                    MessageType::Error,
                    &ErrorMessage {
                        error: code,
                        detail: error.to_string(),
                    },
                );
                TaskOutcome::Failed(code)
            }
            StreamError::ConnectionTerminated => TaskOutcome::ConnectionTerminated,
            _ => {
                warn!(target: "jit::server", peer = ?self.peer, %error, "stream failure, aborting compilation");
                TaskOutcome::Aborted(code)
            }
        }
    }

    fn serve(
        &mut self,
        ctx: &ServerContext,
        compiler: &dyn MethodCompiler,
    ) -> Result<TaskOutcome, StreamError> {
        loop {
            let frame = self.stream.read_frame()?;
            match frame.message_type {
                MessageType::ClientGetVersion => {
                    let hello: ClientHello = frame.decode()?;
                    if (hello.flags ^ ctx.flags) & flags::MUST_MATCH != 0 {
                        return Err(StreamError::VersionIncompatible {
                            local: ProtocolVersion::CURRENT,
                            remote: frame.version,
                        });
                    }
                    self.stream.write_message(
                        MessageType::ServerVersion,
                        &ServerHello {
                            version: ProtocolVersion::CURRENT,
                            flags: ctx.flags,
                            server_uid: ctx.server_uid,
                        },
                    )?;
                }
                MessageType::CompilationRequest => {
                    let request: CompilationRequest = frame.decode()?;
                    return self.compile(ctx, compiler, request);
                }
                MessageType::ClientSessionTerminate => {
                    let terminate: SessionTerminate = frame.decode()?;
                    ctx.sessions.delete(terminate.client_id);
                    return Ok(TaskOutcome::SessionTerminated(terminate.client_id));
                }
                MessageType::ConnectionTerminate => return Ok(TaskOutcome::ConnectionTerminated),
                received => {
                    return Err(StreamError::TypeMismatch {
                        expected: MessageType::CompilationRequest,
                        received,
                    });
                }
            }
        }
    }

    fn fail(&mut self, ctx: &ServerContext, error: CompilationErrorCode) -> Result<TaskOutcome, StreamError> {
        ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stream
            .write_message(MessageType::CompilationFailure, &CompilationFailure { error })?;
        Ok(TaskOutcome::Failed(error))
    }

    fn compile(
        &mut self,
        ctx: &ServerContext,
        compiler: &dyn MethodCompiler,
        request: CompilationRequest,
    ) -> Result<TaskOutcome, StreamError> {
        ctx.stats.requests.fetch_add(1, Ordering::Relaxed);
        ctx.sessions.purge_old_data_if_needed();
        let (session, created) = ctx.sessions.find_or_create(request.client_id);
        if created {
            info!(target: "jit::server", client = %request.client_id, peer = ?self.peer, "new client");
        }
        session.enter();
        let result = self.compile_in_session(ctx, compiler, &request, &session);
        session.leave();
        result
    }

    fn compile_in_session(
        &mut self,
        ctx: &ServerContext,
        compiler: &dyn MethodCompiler,
        request: &CompilationRequest,
        session: &crate::session::ClientSession,
    ) -> Result<TaskOutcome, StreamError> {
        match session.process_in_order(request.seq_no, &request.unloaded_classes, ctx.sequence_timeout)
        {
            Ok(()) => {}
            Err(SequenceError::Stale { seq_no, expected }) => {
                debug!(target: "jit::server", seq_no, expected, "discarding out-of-order request");
                return self.fail(ctx, CompilationErrorCode::StreamLostMessage);
            }
            Err(SequenceError::Terminated) => {
                return self.fail(ctx, CompilationErrorCode::StreamInterrupted);
            }
        }

        let level = request.plan.opt_level;
        let method_name = format!(
            "{}.{}{}",
            request.method.class_name, request.method.name, request.method.signature
        );
        let cache = ctx.aot_cache.as_ref().filter(|_| request.use_aot_cache);
        let key = AotKey::new(&request.method, level);

        if let Some(record) = cache.and_then(|c| c.lookup(&key)) {
            ctx.stats.aot_hits.fetch_add(1, Ordering::Relaxed);
            ctx.stats.compiled.fetch_add(1, Ordering::Relaxed);
            session.record_aot(record.id);
            self.stream.write_message(
                MessageType::CompilationCode,
                &CompilationResponse {
                    code: record.code,
                    opt_level: level,
                    aot_record: Some(record.id),
                    server_uid: ctx.server_uid,
                },
            )?;
            return Ok(TaskOutcome::Compiled {
                client: request.client_id,
                method: method_name,
                level,
                from_aot_cache: true,
            });
        }

        let details = CompileDetails::ordinary(session.method_for(&request.method));
        let compile_request = CompileRequest {
            details: &details,
            plan: &request.plan,
            old_start_pc: request.old_start_pc,
            trace: false,
        };
        let code = match compiler.compile(&compile_request) {
            Ok(code) => code,
            Err(error) => return self.fail(ctx, error),
        };
        let aot_record = cache.map(|c| c.store(key, code.clone()));
        if let Some(id) = aot_record {
            session.record_aot(id);
        }
        ctx.stats.compiled.fetch_add(1, Ordering::Relaxed);
        self.stream.write_message(
            MessageType::CompilationCode,
            &CompilationResponse {
                code,
                opt_level: level,
                aot_record,
                server_uid: ctx.server_uid,
            },
        )?;
        debug!(target: "jit::server", method = %method_name, %level, "remote compilation served");
        Ok(TaskOutcome::Compiled {
            client: request.client_id,
            method: method_name,
            level,
            from_aot_cache: false,
        })
    }
}
