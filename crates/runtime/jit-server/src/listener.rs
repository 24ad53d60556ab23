//! Accept loop of the compilation server
//!
//! Every accepted connection becomes a [`ServerCompilationTask`] handed to a
//! [`ConnectionHandler`], normally the compilation queue.

use crate::server::ServerCompilationTask;
use crate::stream::MessageStream;
use jit_core::RemoteConfig;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

pub trait ConnectionHandler: Send + Sync {
    fn on_connection(&self, task: ServerCompilationTask);
}

#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `config.port` (0 picks a free port) and start accepting.
    pub fn start(config: &RemoteConfig, handler: Arc<dyn ConnectionHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicU64::new(0));
        let timeout = Duration::from_millis(config.timeout_ms);
        #[cfg(feature = "tls")]
        let tls = config.tls.clone().map(crate::tls::TlsContext::new);

        let thread = {
            let shutdown = Arc::clone(&shutdown);
            let accepted = Arc::clone(&accepted);
            std::thread::Builder::new()
                .name("jit-listener".to_string())
                .spawn(move || {
                    info!(target: "jit::server", %local_addr, "listener started");
                    while !shutdown.load(Ordering::Acquire) {
                        let (tcp, peer) = match listener.accept() {
                            Ok(pair) => pair,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                std::thread::sleep(ACCEPT_POLL);
                                continue;
                            }
                            Err(error) => {
                                warn!(target: "jit::server", %error, "accept failed");
                                std::thread::sleep(ACCEPT_POLL);
                                continue;
                            }
                        };
                        if let Err(error) = tcp.set_nonblocking(false) {
                            warn!(target: "jit::server", %error, "cannot configure connection");
                            continue;
                        }
                        #[cfg(feature = "tls")]
                        let stream = match &tls {
                            Some(tls) => tcp
                                .set_read_timeout(Some(timeout))
                                .and_then(|_| tcp.set_write_timeout(Some(timeout)))
                                .map_err(crate::stream::StreamError::from)
                                .and_then(|_| tls.accept(tcp)),
                            None => MessageStream::from_tcp(tcp, Some(timeout)),
                        };
                        #[cfg(not(feature = "tls"))]
                        let stream = MessageStream::from_tcp(tcp, Some(timeout));
                        match stream {
                            Ok(stream) => {
                                accepted.fetch_add(1, Ordering::Relaxed);
                                handler.on_connection(ServerCompilationTask::new(stream, Some(peer)));
                            }
                            Err(error) => {
                                warn!(target: "jit::server", %peer, %error, "connection setup failed")
                            }
                        }
                    }
                    info!(target: "jit::server", "listener stopped");
                })?
        };

        Ok(Self {
            local_addr,
            shutdown,
            accepted,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
