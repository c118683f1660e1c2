//! # io_core
//!
//! Multi-domain TLS/stream I/O reactor: SNI-routed TLS termination over
//! `rustls`, HTTP/1.1 request framing, the RFC 6455 websocket engine,
//! and the `(host, uri)` web router with its JSON/event adapter.
//!
//! See `SPEC_FULL.md` at the workspace root for the full component
//! breakdown (C1-C8) this crate implements.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod events;
pub mod http;
pub mod reactor;
pub mod reconnect;
pub mod router;
pub mod websocket;

pub use connection::{Connection, ConnectionId, ConnectionKind, ConnectionTable};
pub use domain::{Domain, DomainRegistry};
pub use error::{IoError, IoResult};
pub use reactor::{ListenerCallbacks, Reactor, ReactorLimits, TlsClientConfig};
