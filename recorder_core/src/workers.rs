//! # Record worker pool (C11)
//!
//! A fixed pool of `tokio` tasks receiving framed RTP messages from the
//! I/O side and running them through the pipeline under per-entry locks
//! (SPEC_FULL.md §4.4, §5). Every SSRC is routed to the same worker
//! (`ssrc % worker_count`), which is the simplest scheme that preserves
//! "frames for a given SSRC are processed in arrival order" without
//! needing a secondary ordering mechanism: a single channel serves a
//! single consumer task, so per-channel FIFO order is per-SSRC order.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::pipeline;
use crate::stream_table::{RecordingInfo, StreamTable};

/// One RTP frame handed from the I/O side to a worker.
#[derive(Debug, Clone)]
pub struct RtpMessage {
    pub ssrc: u32,
    pub seq: u16,
    pub payload: Bytes,
}

/// Per-worker channel capacity; the pool's total capacity is
/// `worker_count * PER_WORKER_CAPACITY`, matching the
/// `num_threads * 20` default from SPEC_FULL.md §4.4.
const PER_WORKER_CAPACITY: usize = 20;

/// The live pool: one bounded sender per worker.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<RtpMessage>>,
}

impl WorkerPool {
    /// Spawns `worker_count` tasks (default 4 per SPEC_FULL.md §5),
    /// each draining its own bounded queue and running accepted frames
    /// through [`pipeline::process_frame`]. `stopped_tx` receives every
    /// [`RecordingInfo`] a worker's pipeline step closes, for the
    /// signalling adapter (C13) to forward as `notify_new_recording`.
    pub fn spawn(worker_count: usize, table: Arc<StreamTable>, stopped_tx: mpsc::UnboundedSender<RecordingInfo>) -> WorkerPool {
        let worker_count = worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel(PER_WORKER_CAPACITY);
            senders.push(tx);
            let table = Arc::clone(&table);
            let stopped_tx = stopped_tx.clone();
            tokio::spawn(worker_loop(rx, table, stopped_tx));
        }
        WorkerPool { senders }
    }

    /// Routes `msg` to its worker and enqueues it. Drops the frame and
    /// logs a warning if that worker's queue is full, per SPEC_FULL.md
    /// §4.4's back-pressure policy — this call itself never blocks.
    pub fn dispatch(&self, msg: RtpMessage) {
        let index = (msg.ssrc as usize) % self.senders.len();
        if let Err(e) = self.senders[index].try_send(msg) {
            match e {
                mpsc::error::TrySendError::Full(msg) => {
                    warn!(ssrc = msg.ssrc, "worker queue full, dropping frame");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<RtpMessage>, table: Arc<StreamTable>, stopped_tx: mpsc::UnboundedSender<RecordingInfo>) {
    while let Some(msg) = rx.recv().await {
        let Some(entry) = table.entry_by_ssrc(msg.ssrc) else {
            // Unknown SSRC: drop the frame (SPEC_FULL.md §4.4 step 1).
            continue;
        };
        let now = now_epoch_secs();
        let result = table.with_locked(&entry, |stream| pipeline::process_frame(stream, msg.seq, &msg.payload, now));
        match result {
            Ok(Ok(closed)) => {
                for info in closed {
                    let _ = stopped_tx.send(info);
                }
            }
            Ok(Err(e)) => warn!(ssrc = msg.ssrc, error = %e, "pipeline step failed"),
            Err(e) => warn!(ssrc = msg.ssrc, error = %e, "entry lock timed out, dropping frame"),
        }
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Pcm16Codec;
    use crate::stream_table::StreamEntry;
    use crate::vad::VadParams;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn sample_entry(id: Uuid, ssrc: u32, dir: &std::path::Path) -> StreamEntry {
        StreamEntry {
            id,
            ssrc,
            loop_name: "main".into(),
            root: dir.to_path_buf(),
            ext: "wav".into(),
            sample_rate_hz: 8000,
            source_codec: Box::new(Pcm16Codec),
            sink: None,
            file_name: None,
            start_epoch_secs: None,
            pcm_chunker: Default::default(),
            vad: VadParams { zero_cross_hz_threshold: 0.0, power_db_threshold: 0.0, sample_rate_hz: 8000 },
            frames_to_buffer: 1,
            silence_cutoff_frames: 5,
            silent_frames_seen: 0,
            frames_since_roll_reset: 0,
            num_frames_to_roll_after: 0,
            roll_counter: 0,
            frame_counter: lib_common::RateCounter::new(std::time::Instant::now()),
        }
    }

    #[tokio::test]
    async fn dispatched_frames_reach_the_stream_and_open_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(StreamTable::default());
        let id = Uuid::new_v4();
        table.start(id, 99, sample_entry(id, 99, dir.path())).unwrap();

        let (stopped_tx, _stopped_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(2, Arc::clone(&table), stopped_tx);

        pool.dispatch(RtpMessage { ssrc: 99, seq: 0, payload: Bytes::from(vec![0u8; 320]) });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let entry = table.entry_by_ssrc(99).unwrap();
        let _: PathBuf = table.with_locked(&entry, |e| e.root.clone()).unwrap();
    }

    #[tokio::test]
    async fn frames_for_an_unknown_ssrc_are_dropped_without_panicking() {
        let table = Arc::new(StreamTable::default());
        let (stopped_tx, _rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, table, stopped_tx);
        pool.dispatch(RtpMessage { ssrc: 404, seq: 0, payload: Bytes::from_static(&[0, 0]) });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
