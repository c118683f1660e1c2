#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use static_init::dynamic;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

use io_core::connection::{Connection, ConnectionId, ConnectionTable};
use io_core::domain::DomainRegistry;
use io_core::events::EventEngine;
use io_core::http::{self, HttpParseState, ParseOutcome};
use io_core::reactor::{ListenerCallbacks, Reactor, ReactorLimits};
use io_core::router::{HttpResponse, WebRouter};
use io_core::websocket::{self, AssembledMessage, FragmentAssembler, FrameParseOutcome, JsonSender, Opcode};

#[dynamic]
static DOTENV_INIT: () = {
    let platform_env = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(platform_env).ok();
};

fn setup_logging() -> io::Result<()> {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = rolling::daily(&log_dir, "io_server");
    let (non_blocking_appender, guard) = non_blocking(file_appender);
    // Leaked rather than dropped: the guard must outlive every tracing
    // call for the rest of the process, and this is a `fn` called once.
    Box::leak(Box::new(guard));

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking_appender).json();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level)).unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(level = %log_level, "logging initialized");
    Ok(())
}

/// Per-connection protocol state: HTTP framing until an upgrade, then
/// websocket frame/fragment assembly. Not part of `io_core` itself —
/// this is the binary's own glue wiring the HTTP framer (C5), the
/// websocket engine (C6), the router (C7) and the event engine (C8)
/// together over one connection's byte stream.
struct Session {
    http_state: HttpParseState,
    ws: Option<WsSession>,
}

struct WsSession {
    accumulator: Vec<u8>,
    assembler: FragmentAssembler,
    engine: Arc<EventEngine>,
    sender: JsonSender,
}

impl Session {
    fn new() -> Session {
        Session { http_state: HttpParseState::default(), ws: None }
    }
}

/// Drains one connection's inbound-byte channel in order, running its
/// `Session` state machine. Spawned once per connection on first
/// delivery, so bytes are always processed in arrival order even though
/// the reactor's `io_cb` itself is a synchronous, non-blocking callback.
async fn drive_session(
    id: ConnectionId,
    table: Arc<ConnectionTable>,
    router: Arc<WebRouter>,
    host: Option<String>,
    mut inbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let Some(conn) = table.get(id).await else { return };
    let mut session = Session::new();
    let host_key = host.clone().unwrap_or_default();

    while let Some(bytes) = inbound_rx.recv().await {
        if let Err(e) = handle_bytes(&mut session, &conn, &router, &host_key, bytes).await {
            warn!(connection = ?id, error = %e, "protocol error, closing");
            conn.request_close();
            break;
        }
    }
}

async fn handle_bytes(
    session: &mut Session,
    conn: &Arc<Connection>,
    router: &Arc<WebRouter>,
    host: &str,
    bytes: Bytes,
) -> io_core::IoResult<()> {
    if session.ws.is_none() {
        let mut outcome = session.http_state.feed(&bytes);
        loop {
            match outcome {
                ParseOutcome::Progress => return Ok(()),
                ParseOutcome::Error(reason) => {
                    conn.send(Bytes::from(http::error_response(400, "Bad Request")), None).await;
                    return Err(io_core::IoError::Parse(reason));
                }
                ParseOutcome::Success { request, .. } => {
                    if request.is_websocket_upgrade() {
                        let Some(engine) = router.websocket_engine(host, &request.path) else {
                            conn.send(Bytes::from(http::error_response(404, "Not Found")), None).await;
                            return Err(io_core::IoError::Parse(format!(
                                "no websocket route for {}",
                                request.path
                            )));
                        };
                        let client_key = request.header("sec-websocket-key").unwrap_or("").to_string();
                        let accept = websocket::accept_key(&client_key);
                        conn.send(Bytes::from(http::upgrade_response(&accept)), None).await;

                        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                        let forward_conn = Arc::clone(conn);
                        tokio::spawn(async move {
                            while let Some(frame) = frame_rx.recv().await {
                                if !forward_conn.send(Bytes::from(frame), None).await {
                                    break;
                                }
                            }
                        });

                        let remaining = session.http_state.take_remaining();
                        session.ws = Some(WsSession {
                            accumulator: remaining,
                            assembler: FragmentAssembler::default(),
                            engine,
                            sender: JsonSender::new(frame_tx),
                        });
                        return pump_websocket(session.ws.as_mut().unwrap(), conn).await;
                    }

                    let response = router
                        .dispatch_http(host, &request)
                        .unwrap_or_else(|_| HttpResponse { status: 500, reason: "Internal Server Error", body: Vec::new() });
                    conn.send(Bytes::from(response.to_bytes()), None).await;
                    outcome = session.http_state.feed(&[]);
                }
            }
        }
    } else {
        let ws = session.ws.as_mut().unwrap();
        ws.accumulator.extend_from_slice(&bytes);
        pump_websocket(ws, conn).await
    }
}

async fn pump_websocket(ws: &mut WsSession, conn: &Arc<Connection>) -> io_core::IoResult<()> {
    loop {
        match websocket::parse_frame(&ws.accumulator) {
            FrameParseOutcome::Progress => return Ok(()),
            FrameParseOutcome::Error(reason) => {
                conn.send(Bytes::from(websocket::build_frame(true, Opcode::Close, &[])), None).await;
                return Err(io_core::IoError::WsProtocol(reason));
            }
            FrameParseOutcome::Frame { frame, consumed } => {
                ws.accumulator.drain(..consumed);
                match frame.opcode {
                    Opcode::Close => {
                        conn.send(Bytes::from(websocket::build_frame(true, Opcode::Close, &[])), None).await;
                        conn.request_close();
                        return Ok(());
                    }
                    Opcode::Ping => {
                        conn.send(Bytes::from(websocket::build_frame(true, Opcode::Pong, &frame.payload)), None)
                            .await;
                    }
                    Opcode::Pong => {}
                    Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                        if let AssembledMessage::Complete { opcode: Opcode::Text, payload } = ws.assembler.feed(frame)? {
                            match serde_json::from_slice::<serde_json::Value>(&payload) {
                                Ok(value) => ws.engine.dispatch(&value, &ws.sender),
                                Err(e) => warn!(error = %e, "dropping non-JSON websocket text frame"),
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Per-process registry of live per-connection inbound channels, so the
/// reactor's synchronous `io_cb` can forward bytes without blocking:
/// each connection's first delivery spawns its `drive_session` task and
/// every later delivery is a non-blocking `send` into that task's queue.
struct Dispatch {
    table: Arc<ConnectionTable>,
    router: Arc<WebRouter>,
    senders: StdMutex<HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>>,
}

impl Dispatch {
    fn new(table: Arc<ConnectionTable>, router: Arc<WebRouter>) -> Dispatch {
        Dispatch { table, router, senders: StdMutex::new(HashMap::new()) }
    }

    fn deliver(&self, id: ConnectionId, host: Option<String>, bytes: Bytes) {
        let mut senders = self.senders.lock().unwrap();
        let tx = senders.entry(id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drive_session(id, Arc::clone(&self.table), Arc::clone(&self.router), host, rx));
            tx
        });
        let _ = tx.send(bytes);
    }

    fn forget(&self, id: ConnectionId) {
        self.senders.lock().unwrap().remove(&id);
    }
}

fn demo_router() -> Arc<WebRouter> {
    let router = WebRouter::new();
    router.register_http(
        "",
        "/status",
        Arc::new(|_req| HttpResponse::ok(b"{\"status\":\"up\"}".to_vec())),
    );

    let engine = Arc::new(EventEngine::new());
    engine
        .register(
            "echo",
            Arc::new(|_userdata, socket, payload| {
                let _ = socket.send_json(&serde_json::json!({ "event": "echo", "response": payload }));
            }),
        )
        .expect("fixed event name within the length limit");
    router.register_websocket("", "/ws", engine);

    Arc::new(router)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = &*DOTENV_INIT;
    setup_logging().context("failed to initialize logging")?;

    let (cli, config) = io_core::config::load_from_cli().context("failed to load configuration")?;
    info!(config_path = ?cli.config_path, "io_server starting");

    let (domains, limits) = match &config {
        Some(config) => {
            let registry = DomainRegistry::load_dir(&config.domain_dir).context("failed to load domain directory")?;
            (Some(Arc::new(registry)), config.limits)
        }
        None => (None, ReactorLimits::default()),
    };

    let reactor = Reactor::new(domains.clone(), limits);
    reactor.spawn_background_tasks();

    let router = demo_router();
    let dispatch = Arc::new(Dispatch::new(Arc::clone(&reactor.table), Arc::clone(&router)));

    let io_dispatch = Arc::clone(&dispatch);
    let io_cb: io_core::reactor::IoCallback = Arc::new(move |id, domain, bytes| {
        io_dispatch.deliver(id, domain, bytes);
    });
    let close_dispatch = Arc::clone(&dispatch);
    let close_cb: io_core::reactor::CloseCallback = Arc::new(move |id| {
        close_dispatch.forget(id);
    });
    let callbacks = ListenerCallbacks { accept_cb: None, io_cb, close_cb: Some(close_cb), connected_cb: None };

    let plain_addr: SocketAddr = env::var("IO_PLAIN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()).parse()?;
    reactor.listen_tcp(plain_addr, callbacks.clone()).await.context("failed to bind plain listener")?;

    if domains.is_some() {
        let tls_addr: SocketAddr =
            env::var("IO_TLS_ADDR").unwrap_or_else(|_| "0.0.0.0:8443".to_string()).parse()?;
        reactor.listen_tls(tls_addr, callbacks).await.context("failed to bind tls listener")?;
    }

    let shutdown = tokio_graceful::Shutdown::default();
    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!(elapsed_secs = elapsed.as_secs_f64(), "graceful shutdown complete"),
        Err(e) => error!(error = %e, "shutdown timed out"),
    }
    Ok(())
}
