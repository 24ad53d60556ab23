//! Client and server talking over loopback TCP.

use jit_core::{
    CompilationErrorCode, CompileDetails, CompileRequest, MethodFlags, MethodHandle, OptLevel,
    OptimizationPlan, RemoteConfig, SizeModelCompiler,
};
use jit_server::protocol::{ClientHello, ServerHello, flags};
use jit_server::{
    AotCache, ConnectionHandler, Listener, MessageStream, MessageType, ProtocolVersion,
    RemoteCompiler, ServerCompilationTask, ServerContext, TaskOutcome, TcpConnector,
};
use parking_lot::Mutex;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct ThreadPerConnection {
    ctx: Arc<ServerContext>,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
}

impl ConnectionHandler for ThreadPerConnection {
    fn on_connection(&self, task: ServerCompilationTask) {
        let ctx = Arc::clone(&self.ctx);
        let outcomes = Arc::clone(&self.outcomes);
        thread::spawn(move || {
            let outcome = task.run(&ctx, &SizeModelCompiler::default());
            outcomes.lock().push(outcome);
        });
    }
}

struct TestServer {
    ctx: Arc<ServerContext>,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
    listener: Listener,
}

impl TestServer {
    fn start(aot_cache: Option<Arc<AotCache>>) -> Self {
        let ctx = Arc::new(ServerContext::new(
            Duration::from_secs(60),
            aot_cache,
            flags::IS_64BIT,
        ));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let config = RemoteConfig {
            port: 0,
            ..RemoteConfig::default()
        };
        let listener = Listener::start(
            &config,
            Arc::new(ThreadPerConnection {
                ctx: Arc::clone(&ctx),
                outcomes: Arc::clone(&outcomes),
            }),
        )
        .unwrap();
        Self {
            ctx,
            outcomes,
            listener,
        }
    }

    fn client_config(&self, use_aot_cache: bool) -> RemoteConfig {
        RemoteConfig {
            address: "127.0.0.1".to_string(),
            port: self.listener.local_addr().port(),
            timeout_ms: 5_000,
            use_aot_cache,
            ..RemoteConfig::default()
        }
    }

    fn client(&self, use_aot_cache: bool) -> RemoteCompiler {
        let config = self.client_config(use_aot_cache);
        RemoteCompiler::new(&config, Box::new(TcpConnector::new(&config)))
    }

    fn wait_for_outcomes(&self, count: usize) -> Vec<TaskOutcome> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.outcomes.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.outcomes.lock().clone()
    }
}

fn method() -> MethodHandle {
    MethodHandle::new("demo/Shapes", "area", "(D)D", MethodFlags::default())
}

fn compile(
    client: &RemoteCompiler,
    method: &MethodHandle,
    level: OptLevel,
) -> Result<jit_server::RemoteCompiledCode, CompilationErrorCode> {
    let details = CompileDetails::ordinary(method.clone());
    let plan = OptimizationPlan::new(level);
    client.compile(&CompileRequest {
        details: &details,
        plan: &plan,
        old_start_pc: None,
        trace: false,
    })
}

#[test]
fn test_remote_compile_over_loopback() {
    let server = TestServer::start(None);
    let client = server.client(false);
    client.class_unloaded("demo/Gone");

    let compiled = compile(&client, &method(), OptLevel::Hot).unwrap();
    assert_eq!(compiled.code.warm_size, 512 * (OptLevel::Hot as usize + 1));
    assert!(!compiled.from_aot_cache);
    assert_eq!(client.pending_unloads(), 0);

    let outcomes = server.wait_for_outcomes(1);
    assert_eq!(
        outcomes[0],
        TaskOutcome::Compiled {
            client: client.client_id(),
            method: "demo/Shapes.area(D)D".to_string(),
            level: OptLevel::Hot,
            from_aot_cache: false,
        }
    );
    let session = server.ctx.sessions.find(client.client_id()).unwrap();
    assert!(session.is_unloaded("demo/Gone"));
    assert_eq!(server.ctx.stats.snapshot().compiled, 1);
}

#[test]
fn test_second_client_served_from_aot_cache() {
    let cache = Arc::new(AotCache::new());
    let server = TestServer::start(Some(Arc::clone(&cache)));
    let first = server.client(true);
    let second = server.client(true);

    let a = compile(&first, &method(), OptLevel::Warm).unwrap();
    let b = compile(&second, &method(), OptLevel::Warm).unwrap();
    assert_eq!(a.code, b.code);
    assert!(b.from_aot_cache);

    server.wait_for_outcomes(2);
    let stats = server.ctx.stats.snapshot();
    assert_eq!(stats.compiled, 2);
    assert_eq!(stats.aot_hits, 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(server.ctx.sessions.len(), 2);
}

#[test]
fn test_aot_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jit.aotcache");
    let cache = Arc::new(AotCache::new());
    {
        let server = TestServer::start(Some(Arc::clone(&cache)));
        compile(&server.client(true), &method(), OptLevel::Cold).unwrap();
        server.wait_for_outcomes(1);
    }
    assert_eq!(cache.persist(&path).unwrap(), 1);

    let restored = Arc::new(AotCache::new());
    restored.prefetch_catalog(path).unwrap().join().unwrap();
    assert_eq!(restored.len(), 1);
}

#[test]
fn test_session_terminate_removes_session() {
    let server = TestServer::start(None);
    let client = server.client(false);
    compile(&client, &method(), OptLevel::Warm).unwrap();
    server.wait_for_outcomes(1);
    assert_eq!(server.ctx.sessions.len(), 1);

    client.terminate_session();
    let outcomes = server.wait_for_outcomes(2);
    assert_eq!(outcomes[1], TaskOutcome::SessionTerminated(client.client_id()));
    assert!(server.ctx.sessions.is_empty());
}

/// Accepts one connection, answers the handshake, reads the request and
/// hangs up without replying.
fn spawn_dropping_server() -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let mut stream = MessageStream::from_tcp(tcp, Some(Duration::from_secs(5))).unwrap();
        let _: ClientHello = stream.read_expect(MessageType::ClientGetVersion).unwrap();
        stream
            .write_message(
                MessageType::ServerVersion,
                &ServerHello {
                    version: ProtocolVersion::CURRENT,
                    flags: flags::IS_64BIT,
                    server_uid: 1,
                },
            )
            .unwrap();
        stream.read_frame().unwrap();
    });
    (port, handle)
}

#[test]
fn test_connection_dropped_mid_compile_is_stream_failure() {
    let (port, handle) = spawn_dropping_server();
    let config = RemoteConfig {
        address: "127.0.0.1".to_string(),
        port,
        timeout_ms: 5_000,
        ..RemoteConfig::default()
    };
    let client = RemoteCompiler::new(&config, Box::new(TcpConnector::new(&config)));
    client.class_unloaded("demo/Gone");

    let result = compile(&client, &method(), OptLevel::Warm);
    handle.join().unwrap();
    let error = result.unwrap_err();
    assert!(error.is_stream_failure());
    assert!(!client.is_server_available());
    // Unloads travel again with the next request.
    assert_eq!(client.pending_unloads(), 1);
    assert_eq!(client.stats().stream_failures, 1);
}
