//! # lib_common
//!
//! Ambient helpers shared across the workspace. Currently just the
//! overflow-resistant rate counter used by both `io_core` and
//! `recorder_core` for unsynchronised per-thread telemetry.

pub mod counters;

pub use counters::RateCounter;
