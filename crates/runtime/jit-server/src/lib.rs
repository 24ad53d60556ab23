//! Remote compilation (JITServer) support
//!
//! A client VM can offload compilations to a server process. This crate holds
//! both halves of that conversation:
//! - the versioned wire protocol and the message stream, optionally over TLS
//! - per-client sessions on the server, with in-order class-unload updates
//! - the server's shared AOT cache and the client's AOT deserializer
//! - the client-side remote compiler with reconnect backoff
//! - the server's listener, metrics endpoint and statistics thread
//!
//! Every transport failure surfaces as a [`StreamError`] that converts into a
//! stream [`jit_core::CompilationErrorCode`]; callers treat it as a signal to
//! retry or to compile locally.

pub mod aot_cache;
pub mod client;
pub mod listener;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod statistics;
pub mod stream;
#[cfg(feature = "tls")]
pub mod tls;

pub use aot_cache::{AotCache, AotCacheError, AotCacheStats, AotDeserializer, AotKey, AotRecord};
pub use client::{
    ClientStatsSnapshot, Connector, RemoteCompiledCode, RemoteCompiler, ServerAvailability,
    TcpConnector, UnloadTracker,
};
pub use listener::{ConnectionHandler, Listener};
pub use metrics::{Metric, MetricsServer, MetricsSource};
pub use protocol::{MessageType, ProtocolVersion, RemoteMethodRef};
pub use server::{ServerCompilationTask, ServerContext, ServerStats, ServerStatsSnapshot, TaskOutcome};
pub use session::{ClientSession, ClientSessionHT, SequenceError};
pub use statistics::StatisticsThread;
pub use stream::{MessageStream, StreamError, StreamResult};
#[cfg(feature = "tls")]
pub use tls::TlsContext;
