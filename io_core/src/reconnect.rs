//! # Reconnect worker (C4)
//!
//! A lock-protected FIFO of [`ReconnectDescriptor`]s for outbound client
//! connections that died (remote close, error, or initial connect
//! failure) while `auto_reconnect` was set. A single worker task drains
//! the queue on a fixed interval and re-enters [`Reactor::connect_outbound`].
//!
//! Grounded on `lib_common/src/ingestors/yahoo_wss.rs`'s outer
//! reconnect-with-backoff loop, generalized from "one hardcoded upstream"
//! to "a queue of arbitrary descriptors," and on SPEC_FULL.md §4.2's
//! requirement that enqueueing never blocks the reactor: `try_lock`
//! failures are logged and the append is skipped for that cycle rather
//! than awaited.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::reactor::{ListenerCallbacks, Reactor, TlsClientConfig};

/// Everything needed to redo an outbound client connect attempt.
pub struct ReconnectDescriptor {
    pub target: SocketAddr,
    pub tls: TlsClientConfig,
    pub callbacks: ListenerCallbacks,
}

/// The process-wide reconnect queue.
pub struct ReconnectQueue {
    entries: Mutex<VecDeque<ReconnectDescriptor>>,
}

impl Default for ReconnectQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectQueue {
    /// Creates an empty queue.
    pub fn new() -> ReconnectQueue {
        ReconnectQueue {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a descriptor under a non-blocking `try_lock`. If the lock
    /// is contended, the append is skipped and a warning logged — the
    /// reactor's forward progress is never blocked on this queue.
    pub fn enqueue(&self, descriptor: ReconnectDescriptor) {
        match self.entries.try_lock() {
            Ok(mut guard) => guard.push_back(descriptor),
            Err(_) => warn!("reconnect queue contended, dropping this enqueue attempt"),
        }
    }

    /// Runs the worker loop: every `reactor.limits.reconnect_interval_usec`,
    /// drains the queue and re-attempts each descriptor's connect.
    pub async fn run(self: Arc<Self>, reactor: Arc<Reactor>) {
        let interval = Duration::from_micros(reactor.limits.reconnect_interval_usec.max(1));
        loop {
            tokio::time::sleep(interval).await;
            let drained: Vec<ReconnectDescriptor> = {
                let mut guard = self.entries.lock().await;
                guard.drain(..).collect()
            };
            for descriptor in drained {
                if let Err(e) = reactor
                    .connect_outbound(
                        descriptor.target,
                        descriptor.tls,
                        true,
                        descriptor.callbacks,
                    )
                    .await
                {
                    warn!(error = %e, "reconnect attempt failed to start");
                }
            }
        }
    }
}
