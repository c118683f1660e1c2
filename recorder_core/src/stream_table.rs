//! # Stream table (C9)
//!
//! Per-recording entries keyed by both the RTP SSRC that feeds them and
//! an opaque UUID the caller (or `start_record`) assigns. Grounded on
//! `lib_common/src/core/dispatcher.rs`'s registry-lock-then-entry-lock
//! shape, generalized from "dispatch targets" to "stream entries" and
//! from a blocking mutex to `parking_lot`'s `try_lock_for`, per
//! SPEC_FULL.md §5's "entry protected by its own try-lock with a
//! configurable timeout" requirement.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lib_common::RateCounter;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::{Pcm, SourceCodec};
use crate::error::{RecorderError, RecorderResult};
use crate::sink::OutputSink;
use crate::vad::VadParams;

/// Default per-entry lock-acquisition timeout (SPEC_FULL.md §5).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Emitted exactly once per successfully closed recording file.
#[derive(Debug, Clone)]
pub struct RecordingInfo {
    pub id: Uuid,
    pub loop_name: String,
    pub file_name: PathBuf,
    pub start_epoch_secs: u64,
    pub end_epoch_secs: u64,
}

/// One active (or idle-but-armed) recording. Invariant:
/// `sink.is_some()` iff a recording file is currently open;
/// `silent_frames_seen <= silence_cutoff_frames + 1` at rest.
pub struct StreamEntry {
    pub id: Uuid,
    pub ssrc: u32,
    pub loop_name: String,
    pub root: PathBuf,
    pub ext: String,
    pub sample_rate_hz: u32,
    pub source_codec: Box<dyn SourceCodec>,
    pub sink: Option<Box<dyn OutputSink>>,
    pub file_name: Option<PathBuf>,
    pub start_epoch_secs: Option<u64>,
    /// FIFO look-ahead buffer of decoded PCM, one RTP frame's worth per
    /// push.
    pub pcm_chunker: std::collections::VecDeque<Pcm>,
    pub vad: VadParams,
    pub frames_to_buffer: u32,
    pub silence_cutoff_frames: u32,
    pub silent_frames_seen: u64,
    pub frames_since_roll_reset: u64,
    pub num_frames_to_roll_after: u64,
    pub roll_counter: u64,
    /// Frames-processed-per-second telemetry (C14), logged at close.
    pub frame_counter: RateCounter,
}

/// The table's registry lock protects the two indices only; it is
/// dropped before the entry lock is released, matching SPEC_FULL.md
/// §5's "deletions block on in-flight pipeline steps" ordering.
#[derive(Default)]
struct Indices {
    by_id: HashMap<Uuid, Arc<Mutex<StreamEntry>>>,
    ssrc_to_id: HashMap<u32, Uuid>,
}

/// Owns every live stream entry (C9).
pub struct StreamTable {
    indices: std::sync::RwLock<Indices>,
    lock_timeout: Duration,
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl StreamTable {
    pub fn new(lock_timeout: Duration) -> StreamTable {
        StreamTable {
            indices: std::sync::RwLock::new(Indices::default()),
            lock_timeout,
        }
    }

    /// Creates a new entry keyed by `ssrc` and `id`. Rejects with
    /// `AlreadyExists` if the SSRC is already in use, per SPEC_FULL.md
    /// §4.4's `start` contract.
    #[allow(clippy::too_many_arguments)]
    pub fn start(&self, id: Uuid, ssrc: u32, entry: StreamEntry) -> RecorderResult<()> {
        let mut indices = self.indices.write().unwrap();
        if indices.ssrc_to_id.contains_key(&ssrc) {
            return Err(RecorderError::AlreadyExists(id.to_string()));
        }
        indices.ssrc_to_id.insert(ssrc, id);
        indices.by_id.insert(id, Arc::new(Mutex::new(entry)));
        Ok(())
    }

    /// Looks up the entry for an inbound RTP frame by SSRC.
    pub fn entry_by_ssrc(&self, ssrc: u32) -> Option<Arc<Mutex<StreamEntry>>> {
        let indices = self.indices.read().unwrap();
        let id = indices.ssrc_to_id.get(&ssrc)?;
        indices.by_id.get(id).cloned()
    }

    /// Looks up the entry for a signalling command by id (linear in the
    /// sense that the id space has no secondary index beyond the
    /// hash map itself — SPEC_FULL.md §9 leaves a true linear scan vs.
    /// secondary index as an implementer's choice; a `HashMap` already
    /// gives O(1) expected lookup here, so no extra index was added).
    pub fn entry_by_id(&self, id: Uuid) -> Option<Arc<Mutex<StreamEntry>>> {
        self.indices.read().unwrap().by_id.get(&id).cloned()
    }

    /// `{ id: ssrc }` for every currently running recording.
    pub fn list_running(&self) -> HashMap<Uuid, u32> {
        let indices = self.indices.read().unwrap();
        indices.ssrc_to_id.iter().map(|(&ssrc, &id)| (id, ssrc)).collect()
    }

    /// Removes the entry for `id`. Idempotent: an unknown id is a no-op
    /// success, per the error policy table (SPEC_FULL.md §7). Returns
    /// the removed entry (if any) so the caller can close its file
    /// outside the registry lock.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Mutex<StreamEntry>>> {
        let mut indices = self.indices.write().unwrap();
        let entry = indices.by_id.remove(&id)?;
        indices.ssrc_to_id.retain(|_, v| *v != id);
        Some(entry)
    }

    /// Acquires `entry`'s lock with the table's configured timeout,
    /// running `f` while held. Returns `LockTimeout` if the entry is
    /// contended past the deadline.
    pub fn with_locked<R>(&self, entry: &Arc<Mutex<StreamEntry>>, f: impl FnOnce(&mut StreamEntry) -> R) -> RecorderResult<R> {
        match entry.try_lock_for(self.lock_timeout) {
            Some(mut guard) => Ok(f(&mut guard)),
            None => Err(RecorderError::LockTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Pcm16Codec;
    use crate::vad::VadParams;

    fn sample_entry(id: Uuid, ssrc: u32) -> StreamEntry {
        StreamEntry {
            id,
            ssrc,
            loop_name: "main".into(),
            root: PathBuf::from("/tmp/recordings"),
            ext: "wav".into(),
            sample_rate_hz: 8000,
            source_codec: Box::new(Pcm16Codec),
            sink: None,
            file_name: None,
            start_epoch_secs: None,
            pcm_chunker: Default::default(),
            vad: VadParams { zero_cross_hz_threshold: 0.0, power_db_threshold: 0.0, sample_rate_hz: 8000 },
            frames_to_buffer: 2,
            silence_cutoff_frames: 20,
            silent_frames_seen: 0,
            frames_since_roll_reset: 0,
            num_frames_to_roll_after: 0,
            roll_counter: 0,
            frame_counter: lib_common::RateCounter::new(std::time::Instant::now()),
        }
    }

    #[test]
    fn starting_a_duplicate_ssrc_is_rejected() {
        let table = StreamTable::default();
        let id = Uuid::new_v4();
        table.start(id, 42, sample_entry(id, 42)).unwrap();
        let other_id = Uuid::new_v4();
        assert!(table.start(other_id, 42, sample_entry(other_id, 42)).is_err());
    }

    #[test]
    fn stop_on_unknown_id_is_a_no_op() {
        let table = StreamTable::default();
        assert!(table.remove(Uuid::new_v4()).is_none());
    }

    #[test]
    fn list_running_reflects_active_entries() {
        let table = StreamTable::default();
        let id = Uuid::new_v4();
        table.start(id, 7, sample_entry(id, 7)).unwrap();
        assert_eq!(table.list_running().get(&id), Some(&7));
        table.remove(id);
        assert!(table.list_running().is_empty());
    }
}
