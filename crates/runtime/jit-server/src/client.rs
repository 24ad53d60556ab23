//! Client side of remote compilation
//!
//! [`RemoteCompiler`] sends a compilation request to the server over a fresh
//! connection and returns the resulting code. A broken stream never panics
//! and never installs anything: it is logged, the server is marked
//! unavailable for a backoff period, and the compile reports a stream failure
//! so the caller can retry or compile locally.

use crate::aot_cache::AotDeserializer;
use crate::protocol::{
    ClientHello, CompilationFailure, CompilationRequest, CompilationResponse, ErrorMessage,
    MessageType, RemoteMethodRef, ServerHello, SessionTerminate, flags,
};
use crate::stream::{MessageStream, StreamError, StreamResult};
use jit_core::{CompilationErrorCode, CompileRequest, CompiledCode, RemoteConfig};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exponential backoff for reconnecting to the server.
#[derive(Debug, Clone)]
pub struct ServerAvailability {
    base: Duration,
    max: Duration,
    current: Duration,
    retry_at: Option<Instant>,
}

impl ServerAvailability {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: Duration::ZERO,
            retry_at: None,
        }
    }

    pub fn is_available(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.current = if self.current.is_zero() {
            self.base
        } else {
            (self.current * 2).min(self.max)
        };
        self.retry_at = Some(now + self.current);
    }

    pub fn on_success(&mut self) {
        self.current = Duration::ZERO;
        self.retry_at = None;
    }

    pub fn current_backoff(&self) -> Duration {
        self.current
    }
}

/// Classes unloaded or redefined since the last request reached the server.
#[derive(Debug, Default)]
pub struct UnloadTracker {
    pending: BTreeSet<String>,
}

impl UnloadTracker {
    pub fn record(&mut self, class_name: &str) {
        self.pending.insert(class_name.replace('.', "/"));
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Put back classes whose request never made it to the server.
    pub fn restore(&mut self, classes: Vec<String>) {
        self.pending.extend(classes);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Code returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCompiledCode {
    pub code: CompiledCode,
    pub from_aot_cache: bool,
}

/// Opens the byte stream to the server; swapped out by tests and TLS.
pub trait Connector: Send + Sync {
    fn connect(&self) -> StreamResult<MessageStream>;
}

/// Plain TCP (or TLS with the `tls` feature) connector built from config.
#[derive(Debug)]
pub struct TcpConnector {
    address: String,
    port: u16,
    timeout: Duration,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::TlsContext>,
}

impl TcpConnector {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
            #[cfg(feature = "tls")]
            tls: config.tls.clone().map(crate::tls::TlsContext::new),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> StreamResult<MessageStream> {
        let addr = (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StreamError::Io(format!("cannot resolve {}", self.address)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout)?;
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            tcp.set_read_timeout(Some(self.timeout))?;
            tcp.set_write_timeout(Some(self.timeout))?;
            return tls.connect(tcp, &self.address);
        }
        MessageStream::from_tcp(tcp, Some(self.timeout))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub requests: u64,
    pub stream_failures: u64,
    pub aot_loads: u64,
}

pub struct RemoteCompiler {
    client_id: Uuid,
    flags: u64,
    use_aot_cache: bool,
    connector: Box<dyn Connector>,
    seq_no: Mutex<u32>,
    availability: Mutex<ServerAvailability>,
    unloads: Mutex<UnloadTracker>,
    deserializer: Mutex<AotDeserializer>,
    requests: AtomicU64,
    stream_failures: AtomicU64,
    aot_loads: AtomicU64,
    sessions_opened: AtomicU32,
}

impl std::fmt::Debug for RemoteCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCompiler")
            .field("client_id", &self.client_id)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl RemoteCompiler {
    pub fn new(config: &RemoteConfig, connector: Box<dyn Connector>) -> Self {
        let mut client_flags = 0;
        if cfg!(target_pointer_width = "64") {
            client_flags |= flags::IS_64BIT;
        }
        if config.rom_class_sharing {
            client_flags |= flags::ROM_CLASS_SHARING;
        }
        if config.use_aot_cache {
            client_flags |= flags::AOT_CACHE;
        }
        let client_id = Uuid::new_v4();
        info!(target: "jit::server", client = %client_id, address = %config.address, port = config.port, "remote compilation client created");
        Self {
            client_id,
            flags: client_flags,
            use_aot_cache: config.use_aot_cache,
            connector,
            seq_no: Mutex::new(0),
            availability: Mutex::new(ServerAvailability::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_max_ms),
            )),
            unloads: Mutex::new(UnloadTracker::default()),
            deserializer: Mutex::new(AotDeserializer::new()),
            requests: AtomicU64::new(0),
            stream_failures: AtomicU64::new(0),
            aot_loads: AtomicU64::new(0),
            sessions_opened: AtomicU32::new(0),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn is_server_available(&self) -> bool {
        self.availability.lock().is_available(Instant::now())
    }

    /// Note a class unload (or illegal modification) to report with the next
    /// request.
    pub fn class_unloaded(&self, class_name: &str) {
        self.unloads.lock().record(class_name);
    }

    pub fn pending_unloads(&self) -> usize {
        self.unloads.lock().len()
    }

    fn handshake(&self, stream: &mut MessageStream) -> StreamResult<ServerHello> {
        stream.write_message(
            MessageType::ClientGetVersion,
            &ClientHello {
                client_id: self.client_id,
                flags: self.flags,
            },
        )?;
        let frame = stream.read_frame()?;
        match frame.message_type {
            MessageType::ServerVersion => frame.decode(),
            MessageType::Error => {
                let error: ErrorMessage = frame.decode()?;
                warn!(target: "jit::server", detail = %error.detail, "server rejected client");
                Err(StreamError::VersionIncompatible {
                    local: crate::protocol::ProtocolVersion::CURRENT,
                    remote: frame.version,
                })
            }
            received => Err(StreamError::TypeMismatch {
                expected: MessageType::ServerVersion,
                received,
            }),
        }
    }

    /// Compile remotely. Stream failures come back as stream error codes
    /// after the server has been marked unavailable.
    pub fn compile(
        &self,
        request: &CompileRequest<'_>,
    ) -> Result<RemoteCompiledCode, CompilationErrorCode> {
        if !self.is_server_available() {
            return Err(CompilationErrorCode::StreamFailure);
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        let unloaded = self.unloads.lock().drain();
        let method = &request.details.method;
        let message = CompilationRequest {
            client_id: self.client_id,
            seq_no: 0,
            method: RemoteMethodRef {
                class_name: method.class_name().to_string(),
                name: method.name().to_string(),
                signature: method.signature().to_string(),
                has_backward_branches: method.flags().has_backward_branches,
            },
            plan: request.plan.clone(),
            old_start_pc: request.old_start_pc,
            unloaded_classes: unloaded.clone(),
            use_aot_cache: self.use_aot_cache,
        };

        match self.exchange(message) {
            Ok(Ok(response)) => {
                self.availability.lock().on_success();
                self.accept_response(response)
            }
            Ok(Err(error)) => {
                self.availability.lock().on_success();
                Err(error)
            }
            Err(error) => {
                self.stream_failures.fetch_add(1, Ordering::Relaxed);
                // Re-sending an unload the server already applied is harmless.
                self.unloads.lock().restore(unloaded);
                let mut availability = self.availability.lock();
                availability.on_failure(Instant::now());
                warn!(
                    target: "jit::server",
                    method = %method,
                    %error,
                    backoff_ms = availability.current_backoff().as_millis() as u64,
                    "remote compilation failed, server marked unavailable"
                );
                Err(CompilationErrorCode::from(&error))
            }
        }
    }

    /// One connection, one request.
    fn exchange(
        &self,
        mut message: CompilationRequest,
    ) -> StreamResult<Result<CompilationResponse, CompilationErrorCode>> {
        let mut stream = self.connector.connect()?;
        self.handshake(&mut stream)?;
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        // Numbers are assigned only once the request is about to be sent so
        // that the server sees a gap-free sequence.
        {
            let mut seq_no = self.seq_no.lock();
            message.seq_no = *seq_no;
            stream.write_message(MessageType::CompilationRequest, &message)?;
            *seq_no = seq_no.wrapping_add(1);
        }
        debug!(target: "jit::server", seq_no = message.seq_no, "compilation request sent");

        let frame = stream.read_frame()?;
        match frame.message_type {
            MessageType::CompilationCode => Ok(Ok(frame.decode()?)),
            MessageType::CompilationFailure => {
                let failure: CompilationFailure = frame.decode()?;
                Ok(Err(failure.error))
            }
            MessageType::Error => {
                let error: ErrorMessage = frame.decode()?;
                Ok(Err(error.error))
            }
            received => Err(StreamError::TypeMismatch {
                expected: MessageType::CompilationCode,
                received,
            }),
        }
    }

    fn accept_response(
        &self,
        response: CompilationResponse,
    ) -> Result<RemoteCompiledCode, CompilationErrorCode> {
        match response.aot_record {
            Some(record) => {
                let code = self
                    .deserializer
                    .lock()
                    .deserialize(response.server_uid, record, &response.code)?;
                self.aot_loads.fetch_add(1, Ordering::Relaxed);
                Ok(RemoteCompiledCode {
                    code,
                    from_aot_cache: true,
                })
            }
            None => Ok(RemoteCompiledCode {
                code: response.code,
                from_aot_cache: false,
            }),
        }
    }

    /// Tell the server to drop this client's session. Best effort.
    pub fn terminate_session(&self) {
        if self.sessions_opened.load(Ordering::Relaxed) == 0 {
            return;
        }
        let result = self.connector.connect().and_then(|mut stream| {
            stream.write_message(
                MessageType::ClientSessionTerminate,
                &SessionTerminate {
                    client_id: self.client_id,
                },
            )
        });
        if let Err(error) = result {
            debug!(target: "jit::server", %error, "session terminate not delivered");
        }
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            aot_loads: self.aot_loads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut availability =
            ServerAvailability::new(Duration::from_millis(100), Duration::from_millis(350));
        let now = Instant::now();
        assert!(availability.is_available(now));
        availability.on_failure(now);
        assert_eq!(availability.current_backoff(), Duration::from_millis(100));
        assert!(!availability.is_available(now));
        assert!(availability.is_available(now + Duration::from_millis(100)));
        availability.on_failure(now);
        availability.on_failure(now);
        assert_eq!(availability.current_backoff(), Duration::from_millis(350));
        availability.on_success();
        assert!(availability.is_available(now));
    }

    #[test]
    fn test_unload_tracker_restore() {
        let mut tracker = UnloadTracker::default();
        tracker.record("a.B");
        tracker.record("a/B");
        assert_eq!(tracker.len(), 1);
        let drained = tracker.drain();
        assert!(tracker.is_empty());
        tracker.restore(drained);
        assert_eq!(tracker.drain(), vec!["a/B".to_string()]);
    }

    struct Refused;

    impl Connector for Refused {
        fn connect(&self) -> StreamResult<MessageStream> {
            Err(StreamError::Io("connection refused".to_string()))
        }
    }

    #[test]
    fn test_unreachable_server_is_stream_failure() {
        use jit_core::{CompileDetails, MethodFlags, MethodHandle, OptLevel, OptimizationPlan};

        let compiler = RemoteCompiler::new(&RemoteConfig::default(), Box::new(Refused));
        compiler.class_unloaded("x/Y");
        let details = CompileDetails::ordinary(MethodHandle::new("a/B", "f", "()V", MethodFlags::default()));
        let plan = OptimizationPlan::new(OptLevel::Warm);
        let request = CompileRequest {
            details: &details,
            plan: &plan,
            old_start_pc: None,
            trace: false,
        };
        assert_eq!(compiler.compile(&request), Err(CompilationErrorCode::StreamFailure));
        assert!(!compiler.is_server_available());
        assert_eq!(compiler.pending_unloads(), 1);
        // Backoff short-circuits without touching the network.
        assert_eq!(compiler.compile(&request), Err(CompilationErrorCode::StreamFailure));
        assert_eq!(compiler.stats().stream_failures, 1);
    }
}
