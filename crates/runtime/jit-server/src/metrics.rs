//! Prometheus-style metrics endpoint
//!
//! Served by axum on a dedicated thread with its own current-thread tokio
//! runtime, so the compilation threads never run inside an async context.

use crate::server::ServerContext;
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub help: &'static str,
    pub value: f64,
}

impl Metric {
    pub fn new(name: &'static str, help: &'static str, value: impl Into<f64>) -> Self {
        Self {
            name,
            help,
            value: value.into(),
        }
    }
}

pub trait MetricsSource: Send + Sync {
    fn collect(&self) -> Vec<Metric>;
}

impl<F> MetricsSource for F
where
    F: Fn() -> Vec<Metric> + Send + Sync,
{
    fn collect(&self) -> Vec<Metric> {
        self()
    }
}

impl MetricsSource for ServerContext {
    fn collect(&self) -> Vec<Metric> {
        let stats = self.stats.snapshot();
        let mut metrics = vec![
            Metric::new("jitserver_requests_total", "Compilation requests received", stats.requests as f64),
            Metric::new("jitserver_compiled_total", "Compilations answered with code", stats.compiled as f64),
            Metric::new("jitserver_failed_total", "Compilations answered with a failure", stats.failed as f64),
            Metric::new("jitserver_aot_cache_hits_total", "Requests served from the AOT cache", stats.aot_hits as f64),
            Metric::new("jitserver_stream_errors_total", "Connections lost mid-request", stats.stream_errors as f64),
            Metric::new("jitserver_client_sessions", "Live client sessions", self.sessions.len() as f64),
        ];
        if let Some(cache) = &self.aot_cache {
            metrics.push(Metric::new(
                "jitserver_aot_cache_records",
                "Records held by the AOT cache",
                cache.len() as f64,
            ));
        }
        metrics
    }
}

/// Render metrics in the Prometheus text exposition format.
pub fn render(metrics: &[Metric]) -> String {
    let mut out = String::new();
    for metric in metrics {
        let kind = if metric.name.ends_with("_total") {
            "counter"
        } else {
            "gauge"
        };
        let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
        let _ = writeln!(out, "# TYPE {} {}", metric.name, kind);
        let _ = writeln!(out, "{} {}", metric.name, metric.value);
    }
    out
}

async fn metrics_handler(State(source): State<Arc<dyn MetricsSource>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&source.collect()),
    )
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug)]
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MetricsServer {
    pub fn start(port: u16, source: Arc<dyn MetricsSource>) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown, stopped) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("jit-metrics".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(error) => {
                            warn!(target: "jit::server", %error, "metrics listener unusable");
                            return;
                        }
                    };
                    let app = Router::new()
                        .route("/metrics", get(metrics_handler))
                        .route("/health", get(health_handler))
                        .with_state(source);
                    info!(target: "jit::server", %local_addr, "metrics server listening");
                    let served = axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = stopped.await;
                        })
                        .await;
                    if let Err(error) = served {
                        warn!(target: "jit::server", %error, "metrics server failed");
                    }
                });
            })?;

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn test_render_marks_counters_and_gauges() {
        let text = render(&[
            Metric::new("a_total", "things", 3u32),
            Metric::new("b", "level", 1.5),
        ]);
        assert!(text.contains("# TYPE a_total counter\na_total 3\n"));
        assert!(text.contains("# TYPE b gauge\nb 1.5\n"));
    }

    #[test]
    fn test_metrics_endpoint_serves_source() {
        let source: Arc<dyn MetricsSource> =
            Arc::new(|| vec![Metric::new("jit_compiled_total", "compiled", 7u32)]);
        let mut server = MetricsServer::start(0, source).unwrap();
        let port = server.local_addr().port();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("jit_compiled_total 7"));

        server.stop();
    }
}
