//! # recorder_core
//!
//! Multicast RTP voice recorder: per-SSRC decode→chunk→VAD→write
//! pipeline with voice-onset file opening, silence-triggered closing,
//! and optional N-frame rolling.
//!
//! See `SPEC_FULL.md` at the workspace root for the full component
//! breakdown (C9-C14) this crate implements.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod codec;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod signalling;
pub mod sink;
pub mod stream_table;
pub mod vad;
pub mod workers;

pub use error::{RecorderError, RecorderResult};
pub use signalling::{SignallingAdapter, SignallingConfig};
pub use stream_table::{RecordingInfo, StreamEntry, StreamTable};
pub use workers::{RtpMessage, WorkerPool};
