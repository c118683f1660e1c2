//! # I/O reactor (C3)
//!
//! The reactor is the `tokio` runtime itself, per the mapping decision in
//! SPEC_FULL.md §1.1: each accepted or originated connection is driven by
//! its own task, cooperatively scheduled, with `tokio::select!` playing
//! the role of the source's level-triggered dispatch loop. This module
//! wires accept loops, per-connection read/write tasks, TLS handshakes,
//! and the idle-timeout sweep together over the [`ConnectionTable`].
//!
//! Grounded on `servers/src/server_dummy.rs`'s rustls `ServerConfig`
//! construction (generalized via [`crate::domain::DomainRegistry`]) and
//! `lib_common/src/ingestors/yahoo_wss.rs`'s reconnect/watchdog
//! `tokio::select!` shape (generalized into [`crate::reconnect`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId, ConnectionKind, ConnectionTable};
use crate::domain::DomainRegistry;
use crate::error::{IoError, IoResult};
use crate::reconnect::{ReconnectDescriptor, ReconnectQueue};

/// Invoked once per accepted connection before it is installed; returning
/// `false` rejects it.
pub type AcceptCallback = Arc<dyn Fn(ConnectionId) -> bool + Send + Sync>;
/// Invoked once per inbound delivery of bytes. `domain` is the
/// SNI-resolved domain name for TLS connections, `None` for plain ones.
pub type IoCallback = Arc<dyn Fn(ConnectionId, Option<String>, Bytes) + Send + Sync>;
/// Invoked exactly once when a connection closes, after its last `io_cb`.
pub type CloseCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;
/// Invoked once an outbound client connection's handshake (if any)
/// completes, before its first `io_cb`.
pub type ConnectedCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Callback bundle a Listener installs on every connection it accepts.
#[derive(Clone)]
pub struct ListenerCallbacks {
    pub accept_cb: Option<AcceptCallback>,
    pub io_cb: IoCallback,
    pub close_cb: Option<CloseCallback>,
    pub connected_cb: Option<ConnectedCallback>,
}

/// TLS client configuration for an outbound connection: SNI name and
/// mandatory verify location (file or dir), per SPEC_FULL.md §4.2 — a
/// connect without one of these is refused before any socket is opened.
#[derive(Clone)]
pub struct TlsClientConfig {
    pub sni_domain: String,
    pub ca_file: Option<std::path::PathBuf>,
    pub ca_path: Option<std::path::PathBuf>,
    pub client_cert_and_key: Option<(
        Vec<rustls_pki_types::CertificateDer<'static>>,
        rustls_pki_types::PrivateKeyDer<'static>,
    )>,
}

/// Timing knobs for the idle-timeout sweep and reconnect worker.
#[derive(Clone, Copy)]
pub struct ReactorLimits {
    pub accept_to_io_timeout_usec: u64,
    pub io_timeout_usec: u64,
    pub reconnect_interval_usec: u64,
}

impl Default for ReactorLimits {
    fn default() -> Self {
        ReactorLimits {
            accept_to_io_timeout_usec: 3_000_000,
            io_timeout_usec: 3_000_000,
            reconnect_interval_usec: 3_000_000,
        }
    }
}

/// The reactor's owned state: the connection table, the optional domain
/// registry (for TLS/SNI listeners), and the reconnect queue.
pub struct Reactor {
    pub table: Arc<ConnectionTable>,
    pub domains: Option<Arc<DomainRegistry>>,
    pub limits: ReactorLimits,
    reconnect: Arc<ReconnectQueue>,
}

impl Reactor {
    /// Creates a reactor. `domains` is `None` for a reactor that never
    /// terminates TLS (e.g. a pure outbound client process).
    pub fn new(domains: Option<Arc<DomainRegistry>>, limits: ReactorLimits) -> Arc<Reactor> {
        Arc::new(Reactor {
            table: Arc::new(ConnectionTable::new()),
            domains,
            limits,
            reconnect: Arc::new(ReconnectQueue::new()),
        })
    }

    /// Spawns the background idle-timeout sweep and the reconnect worker.
    /// Call once after constructing the reactor.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let reactor = Arc::clone(self);
        tokio::spawn(async move { reactor.idle_sweep_loop().await });

        let reactor = Arc::clone(self);
        let queue = Arc::clone(&self.reconnect);
        tokio::spawn(async move { queue.run(reactor).await });
    }

    async fn idle_sweep_loop(self: Arc<Self>) {
        let interval = Duration::from_micros(
            self.limits
                .accept_to_io_timeout_usec
                .min(self.limits.reconnect_interval_usec)
                .max(1),
        );
        loop {
            tokio::time::sleep(interval).await;
            let expired = self
                .table
                .sweep_idle(self.limits.accept_to_io_timeout_usec, self.limits.io_timeout_usec)
                .await;
            for id in expired {
                debug!(connection = ?id, "idle timeout, closing");
                if let Some(conn) = self.table.get(id).await {
                    conn.request_close();
                }
                self.table.remove(id).await;
            }
        }
    }

    /// Binds a plain TCP listener and spawns its accept loop.
    pub async fn listen_tcp(
        self: &Arc<Self>,
        addr: SocketAddr,
        callbacks: ListenerCallbacks,
    ) -> IoResult<ConnectionId> {
        let listener = TcpListener::bind(addr).await?;
        let (handle, _rx) = self.table.insert(ConnectionKind::Listener, None, false).await;
        info!(%addr, "listening (plain)");
        let reactor = Arc::clone(self);
        let listener_id = handle.id;
        tokio::spawn(async move {
            reactor.accept_loop_plain(listener, listener_id, callbacks).await;
        });
        Ok(listener_id)
    }

    /// Binds a TLS-terminating TCP listener using the reactor's domain
    /// registry for SNI routing, and spawns its accept loop.
    pub async fn listen_tls(
        self: &Arc<Self>,
        addr: SocketAddr,
        callbacks: ListenerCallbacks,
    ) -> IoResult<ConnectionId> {
        let domains = self
            .domains
            .as_ref()
            .ok_or_else(|| IoError::Domain("no domain registry configured".into()))?;
        let server_config = domains.server_config()?;
        let acceptor = TlsAcceptor::from(server_config);
        let listener = TcpListener::bind(addr).await?;
        let (handle, _rx) = self.table.insert(ConnectionKind::Listener, None, false).await;
        info!(%addr, "listening (tls)");
        let reactor = Arc::clone(self);
        let listener_id = handle.id;
        tokio::spawn(async move {
            reactor
                .accept_loop_tls(listener, acceptor, listener_id, callbacks)
                .await;
        });
        Ok(listener_id)
    }

    /// Binds a Unix-domain listener and spawns its accept loop. Plain
    /// only: TLS-over-Unix-socket is not a configuration this reactor
    /// supports (unneeded by the spec; Unix sockets are for local IPC).
    pub async fn listen_unix(
        self: &Arc<Self>,
        path: impl AsRef<std::path::Path>,
        callbacks: ListenerCallbacks,
    ) -> IoResult<ConnectionId> {
        let listener = UnixListener::bind(path)?;
        let (handle, _rx) = self.table.insert(ConnectionKind::Listener, None, false).await;
        let reactor = Arc::clone(self);
        let listener_id = handle.id;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let (conn, outbound_rx) = reactor
                            .table
                            .insert(ConnectionKind::InboundAccepted, Some(listener_id), false)
                            .await;
                        if let Some(cb) = &callbacks.accept_cb {
                            if !cb(conn.id) {
                                reactor.table.remove(conn.id).await;
                                continue;
                            }
                        }
                        let (rd, wr) = stream.into_split();
                        let callbacks = callbacks.clone();
                        tokio::spawn(async move {
                            run_plain_duplex(rd, wr, conn, outbound_rx, None, callbacks).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "unix accept failed");
                        break;
                    }
                }
            }
        });
        Ok(listener_id)
    }

    async fn accept_loop_plain(
        self: Arc<Self>,
        listener: TcpListener,
        listener_id: ConnectionId,
        callbacks: ListenerCallbacks,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let (conn, outbound_rx) = self
                        .table
                        .insert(ConnectionKind::InboundAccepted, Some(listener_id), false)
                        .await;
                    if let Some(cb) = &callbacks.accept_cb {
                        if !cb(conn.id) {
                            self.table.remove(conn.id).await;
                            continue;
                        }
                    }
                    apply_sndbuf_hint(&conn, &stream);
                    debug!(%peer, connection = ?conn.id, "accepted (plain)");
                    let (rd, wr) = stream.into_split();
                    let callbacks = callbacks.clone();
                    tokio::spawn(async move {
                        run_plain_duplex(rd, wr, conn, outbound_rx, None, callbacks).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    async fn accept_loop_tls(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        listener_id: ConnectionId,
        callbacks: ListenerCallbacks,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let (conn, outbound_rx) = self
                        .table
                        .insert(ConnectionKind::InboundAccepted, Some(listener_id), false)
                        .await;
                    if let Some(cb) = &callbacks.accept_cb {
                        if !cb(conn.id) {
                            self.table.remove(conn.id).await;
                            continue;
                        }
                    }
                    apply_sndbuf_hint(&conn, &stream);
                    debug!(%peer, connection = ?conn.id, "accepted (tls)");
                    let acceptor = acceptor.clone();
                    let callbacks = callbacks.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let sni = tls_stream
                                    .get_ref()
                                    .1
                                    .server_name()
                                    .map(|s| s.to_string());
                                if let Ok(mut guard) = conn.sni_resolved_domain.write() {
                                    *guard = sni.clone();
                                }
                                let (rd, wr) = tokio::io::split(tls_stream);
                                run_tls_duplex(rd, wr, conn, outbound_rx, sni, callbacks).await;
                            }
                            Err(e) => {
                                debug!(error = %e, "tls handshake failed, closing without shutdown");
                                self.table.remove(conn.id).await;
                                if let Some(cb) = &callbacks.close_cb {
                                    cb(conn.id);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "tls accept failed");
                    break;
                }
            }
        }
    }

    /// Originates an outbound TLS client connection. Returns the new
    /// connection's id immediately (resolving the Open Question in
    /// SPEC_FULL.md §9 in favor of the intuitive, non-buggy behaviour):
    /// the connection is live in the table in a connecting state, not
    /// already enqueued for reconnect.
    pub async fn connect_outbound(
        self: &Arc<Self>,
        target: SocketAddr,
        tls: TlsClientConfig,
        auto_reconnect: bool,
        callbacks: ListenerCallbacks,
    ) -> IoResult<ConnectionId> {
        if tls.ca_file.is_none() && tls.ca_path.is_none() {
            return Err(IoError::Domain(
                "outbound TLS client requires a verify location (ca_file or ca_path)".into(),
            ));
        }
        let (conn, outbound_rx) = self
            .table
            .insert(ConnectionKind::OutboundClient, None, auto_reconnect)
            .await;
        let connector = build_client_connector(&tls)?;
        let reactor = Arc::clone(self);
        let id = conn.id;
        let tls_for_retry = tls.clone();
        let callbacks_for_retry = callbacks.clone();
        tokio::spawn(async move {
            reactor
                .run_outbound_connect(target, connector, tls.sni_domain, conn, outbound_rx, callbacks)
                .await;
            if auto_reconnect {
                reactor.reconnect.enqueue(ReconnectDescriptor {
                    target,
                    tls: tls_for_retry,
                    callbacks: callbacks_for_retry,
                });
            }
        });
        Ok(id)
    }

    async fn run_outbound_connect(
        self: Arc<Self>,
        target: SocketAddr,
        connector: TlsConnector,
        sni_domain: String,
        conn: Arc<Connection>,
        outbound_rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
        callbacks: ListenerCallbacks,
    ) {
        let stream = match TcpStream::connect(target).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "outbound connect failed");
                self.fail_outbound(conn, &callbacks).await;
                return;
            }
        };
        apply_sndbuf_hint(&conn, &stream);
        let server_name = match ServerName::try_from(sni_domain.clone()) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "invalid SNI name");
                self.fail_outbound(conn, &callbacks).await;
                return;
            }
        };
        match connector.connect(server_name, stream).await {
            Ok(tls_stream) => {
                if let Some(cb) = &callbacks.connected_cb {
                    cb(conn.id);
                }
                let (rd, wr) = tokio::io::split(tls_stream);
                run_tls_duplex(rd, wr, conn, outbound_rx, Some(sni_domain), callbacks).await;
            }
            Err(e) => {
                warn!(error = %e, "tls client handshake failed");
                self.fail_outbound(conn, &callbacks).await;
            }
        }
    }

    async fn fail_outbound(&self, conn: Arc<Connection>, callbacks: &ListenerCallbacks) {
        let id = conn.id;
        self.table.remove(id).await;
        if let Some(cb) = &callbacks.close_cb {
            cb(id);
        }
    }

    /// Access to the reconnect queue, for a caller that wants to enqueue
    /// a descriptor after an outbound connection dies (C4).
    pub fn reconnect_queue(&self) -> Arc<ReconnectQueue> {
        Arc::clone(&self.reconnect)
    }
}

/// Reads the kernel's current `SO_SNDBUF` size for `stream` and records
/// it on `conn`, so outbound sends split at the same boundary the OS
/// would coalesce writes at. Falls back silently to the connection's
/// existing default if the syscall fails.
fn apply_sndbuf_hint(conn: &Connection, stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Ok(size) = sock_ref.send_buffer_size() {
        if size > 0 {
            conn.set_send_chunk_size(size);
        }
    }
}

fn build_client_connector(tls: &TlsClientConfig) -> IoResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca_file) = &tls.ca_file {
        let data = std::fs::read(ca_file)?;
        let mut reader = std::io::Cursor::new(data);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(std::io::Error::from)?;
            let _ = roots.add(cert);
        }
    }
    if let Some(ca_path) = &tls.ca_path {
        for entry in std::fs::read_dir(ca_path)?.flatten() {
            let data = std::fs::read(entry.path())?;
            let mut reader = std::io::Cursor::new(data);
            for cert in rustls_pemfile::certs(&mut reader) {
                if let Ok(cert) = cert {
                    let _ = roots.add(cert);
                }
            }
        }
    }
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = if let Some((chain, key)) = tls.client_cert_and_key.clone() {
        builder
            .with_client_auth_cert(chain, key)
            .map_err(IoError::Tls)?
    } else {
        builder.with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn run_plain_duplex(
    mut rd: tokio::net::tcp::OwnedReadHalf,
    mut wr: tokio::net::tcp::OwnedWriteHalf,
    conn: Arc<Connection>,
    mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    domain: Option<String>,
    callbacks: ListenerCallbacks,
) {
    let mut close_rx = conn.close_signal();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = close_rx.changed() => { break; }
            result = rd.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        conn.mark_io().await;
                        (callbacks.io_cb)(conn.id, domain.clone(), Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(_) => break,
                }
            }
            chunk = outbound_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if wr.write_all(&chunk).await.is_ok() {
                            conn.mark_io().await;
                            conn.ack_flushed().await;
                        } else {
                            break;
                        }
                    }
                    None => {}
                }
            }
        }
    }
    if let Some(cb) = &callbacks.close_cb {
        cb(conn.id);
    }
}

async fn run_tls_duplex<R, W>(
    mut rd: R,
    mut wr: W,
    conn: Arc<Connection>,
    mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    domain: Option<String>,
    callbacks: ListenerCallbacks,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut close_rx = conn.close_signal();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = close_rx.changed() => { break; }
            result = rd.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        conn.mark_io().await;
                        (callbacks.io_cb)(conn.id, domain.clone(), Bytes::copy_from_slice(&buf[..n]));
                    }
                    // Any TLS-layer error here is non-recoverable at this
                    // granularity (tokio_rustls already retries the
                    // WANT_READ/WANT_WRITE cases internally): close
                    // without attempting an orderly shutdown.
                    Err(_) => break,
                }
            }
            chunk = outbound_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if wr.write_all(&chunk).await.is_ok() {
                            conn.mark_io().await;
                            conn.ack_flushed().await;
                        } else {
                            break;
                        }
                    }
                    None => {}
                }
            }
        }
    }
    let _ = wr.shutdown().await;
    if let Some(cb) = &callbacks.close_cb {
        cb(conn.id);
    }
}
