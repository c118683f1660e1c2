#![allow(dead_code)]

use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use static_init::dynamic;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

use io_core::reactor::{ConnectedCallback, IoCallback, ListenerCallbacks, Reactor, ReactorLimits, TlsClientConfig};
use recorder_core::signalling::SignallingConfig;
use recorder_core::stream_table::DEFAULT_LOCK_TIMEOUT;
use recorder_core::vad::VadParams;
use recorder_core::{SignallingAdapter, StreamTable, WorkerPool};

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

    let file_appender = rolling::daily(&log_dir, "recorder");
    let (non_blocking_appender, guard) = non_blocking(file_appender);
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

/// `-c <config-path>` selects the recorder's JSON config; `-v` prints
/// the version and exits with the same distinguished sentinel exit
/// status the reactor CLI uses (SPEC_FULL.md §6).
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Multicast RTP recorder", long_about = None)]
struct Cli {
    #[clap(short = 'c', long = "config", env = "RECORDER_CONFIG")]
    config_path: Option<PathBuf>,
}

const VERSION_EXIT_CODE: i32 = 78;

#[derive(Debug, Deserialize)]
struct RecorderConfigFile {
    root: PathBuf,
    #[serde(default = "default_sample_rate")]
    sample_rate_hz: u32,
    #[serde(default = "default_ext")]
    default_ext: String,
    #[serde(default = "default_frames_to_buffer")]
    frames_to_buffer: u32,
    #[serde(default = "default_silence_cutoff")]
    silence_cutoff_frames: u32,
    #[serde(default = "default_worker_count")]
    worker_count: usize,
    #[serde(default)]
    vad: VadConfigFile,
    resmgr: ResmgrConfigFile,
}

#[derive(Debug, Deserialize)]
struct VadConfigFile {
    #[serde(default)]
    zero_cross_hz_threshold: f64,
    #[serde(default)]
    power_db_threshold: f64,
}

impl Default for VadConfigFile {
    fn default() -> VadConfigFile {
        VadConfigFile { zero_cross_hz_threshold: 0.0, power_db_threshold: 0.0 }
    }
}

#[derive(Debug, Deserialize)]
struct ResmgrConfigFile {
    addr: SocketAddr,
    sni_domain: String,
    ca_file: Option<PathBuf>,
    ca_path: Option<PathBuf>,
}

fn default_sample_rate() -> u32 {
    8000
}
fn default_ext() -> String {
    "wav".into()
}
fn default_frames_to_buffer() -> u32 {
    3
}
fn default_silence_cutoff() -> u32 {
    50
}
fn default_worker_count() -> usize {
    4
}

fn load_config(path: &std::path::Path) -> Result<RecorderConfigFile> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: RecorderConfigFile = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = &*DOTENV_INIT;
    setup_logging().context("failed to initialize logging")?;

    let cli = Cli::parse();
    if env::args().any(|a| a == "-v") {
        eprintln!("{}", env!("CARGO_PKG_VERSION"));
        std::process::exit(VERSION_EXIT_CODE);
    }
    let config_path = cli.config_path.context("no -c <config-path> given")?;
    let config = load_config(&config_path).context("failed to load configuration")?;
    info!(config_path = ?config_path, "recorder starting");

    let reactor = Reactor::new(None, ReactorLimits::default());
    reactor.spawn_background_tasks();

    let table = Arc::new(StreamTable::new(DEFAULT_LOCK_TIMEOUT));
    let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(WorkerPool::spawn(config.worker_count, Arc::clone(&table), stopped_tx));

    let signalling_config = SignallingConfig {
        root: config.root.clone(),
        default_vad: VadParams {
            zero_cross_hz_threshold: config.vad.zero_cross_hz_threshold,
            power_db_threshold: config.vad.power_db_threshold,
            sample_rate_hz: config.sample_rate_hz,
        },
        frames_to_buffer: config.frames_to_buffer,
        silence_cutoff_frames: config.silence_cutoff_frames,
        sample_rate_hz: config.sample_rate_hz,
        default_ext: config.default_ext.clone(),
    };
    let adapter = SignallingAdapter::new(Arc::clone(&table), Arc::clone(&pool), signalling_config);
    adapter.spawn_notify_forwarder(stopped_rx);

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(drive_resmgr(Arc::clone(&adapter), inbound_rx));
    let io_cb: IoCallback = Arc::new(move |_id, _domain, bytes| {
        let _ = inbound_tx.send(bytes);
    });

    let table_for_connected = Arc::clone(&reactor.table);
    let adapter_for_connected = Arc::clone(&adapter);
    let connected_cb: ConnectedCallback = Arc::new(move |id| {
        let table = Arc::clone(&table_for_connected);
        let adapter = Arc::clone(&adapter_for_connected);
        tokio::spawn(async move {
            if let Some(conn) = table.get(id).await {
                adapter.set_connection(conn);
            }
        });
    });

    let callbacks = ListenerCallbacks { accept_cb: None, io_cb, close_cb: None, connected_cb: Some(connected_cb) };
    let tls = TlsClientConfig {
        sni_domain: config.resmgr.sni_domain.clone(),
        ca_file: config.resmgr.ca_file.clone(),
        ca_path: config.resmgr.ca_path.clone(),
        client_cert_and_key: None,
    };
    reactor
        .connect_outbound(config.resmgr.addr, tls, true, callbacks)
        .await
        .context("failed to start resource-manager connection")?;

    let shutdown_signal = adapter.shutdown_signal();
    tokio::select! {
        _ = shutdown_signal.notified() => {
            info!("shutdown event received from resource manager, exiting");
        }
        result = tokio_graceful::Shutdown::default().shutdown_with_limit(Duration::from_secs(10)) => {
            match result {
                Ok(elapsed) => info!(elapsed_secs = elapsed.as_secs_f64(), "graceful shutdown complete"),
                Err(e) => error!(error = %e, "shutdown timed out"),
            }
        }
    }
    Ok(())
}

/// Splits the resource-manager connection's inbound byte stream on `\n`
/// and feeds each line to the signalling adapter. Not part of
/// `recorder_core` itself — binary-level glue mirroring `io_server.rs`'s
/// `drive_session`, just for a single newline-delimited-JSON connection
/// instead of HTTP/websocket framing.
async fn drive_resmgr(adapter: Arc<SignallingAdapter>, mut inbound_rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(bytes) = inbound_rx.recv().await {
        buf.extend_from_slice(&bytes);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            match std::str::from_utf8(&line[..line.len() - 1]) {
                Ok(s) => adapter.handle_line(s).await,
                Err(e) => warn!(error = %e, "dropping non-UTF8 signalling line"),
            }
        }
    }
}
