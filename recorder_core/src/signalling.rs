//! # Signalling adapter (C13)
//!
//! Translates `start_record`/`stop_record`/`list_running_recordings`/
//! `shutdown` events from a resource-manager peer into stream-table and
//! pipeline calls, and forwards every closed-file [`RecordingInfo`] as
//! `notify_new_recording`. Grounded on
//! `ov_recorder_app.c`'s `cb_record_start`/`start_recording`, which ties
//! multicast-socket bring-up directly to the `start_record` handler —
//! this module does the same rather than splitting ingest into its own
//! layer.
//!
//! The wire to the resource manager is newline-delimited JSON over the
//! reactor's outbound-client connection, not websocket framing: `io_core`'s
//! websocket engine (C6) is documented as server-role-only (it always
//! unmasks inbound frames and always sends unmasked), and the resmgr
//! peer's wire contract is out of scope for this repository, specified
//! only by the message bodies it exchanges (SPEC_FULL.md §1).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use io_core::connection::Connection;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::codec::codec_for_spec;
use crate::pipeline;
use crate::stream_table::{RecordingInfo, StreamEntry, StreamTable};
use crate::vad::VadParams;
use crate::workers::{RtpMessage, WorkerPool};

/// Fixed app-wide defaults a `start_record` request falls back on when it
/// does not override them — the original's per-app `rec_app` defaults.
#[derive(Clone)]
pub struct SignallingConfig {
    pub root: PathBuf,
    pub default_vad: VadParams,
    pub frames_to_buffer: u32,
    pub silence_cutoff_frames: u32,
    pub sample_rate_hz: u32,
    pub default_ext: String,
}

/// One in-flight multicast listener, keyed by recording id so
/// `stop_record` can cancel it.
struct Ingest {
    task: JoinHandle<()>,
}

/// C13 itself.
pub struct SignallingAdapter {
    table: Arc<StreamTable>,
    pool: Arc<WorkerPool>,
    config: SignallingConfig,
    uuid: Uuid,
    next_ssrc: AtomicU32,
    ingest: StdMutex<HashMap<Uuid, Ingest>>,
    outbound: StdMutex<Option<Arc<Connection>>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl SignallingAdapter {
    pub fn new(table: Arc<StreamTable>, pool: Arc<WorkerPool>, config: SignallingConfig) -> Arc<SignallingAdapter> {
        Arc::new(SignallingAdapter {
            table,
            pool,
            config,
            uuid: Uuid::new_v4(),
            next_ssrc: AtomicU32::new(1),
            ingest: StdMutex::new(HashMap::new()),
            outbound: StdMutex::new(None),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Fires once the outbound connection to the resource manager
    /// completes; sends `register` immediately afterward.
    pub fn set_connection(&self, conn: Arc<Connection>) {
        *self.outbound.lock().unwrap() = Some(conn);
        self.send(&json!({
            "event": "register",
            "parameter": { "type": "recorder", "uuid": self.uuid.to_string() },
        }));
    }

    /// Resolves when a `shutdown` event has been handled, so the binary's
    /// main loop can exit.
    pub fn shutdown_signal(&self) -> Arc<tokio::sync::Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Spawns the task that forwards every closed recording (from the
    /// worker pool) onward as `notify_new_recording`.
    pub fn spawn_notify_forwarder(self: &Arc<Self>, mut stopped_rx: mpsc::UnboundedReceiver<RecordingInfo>) {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(info) = stopped_rx.recv().await {
                adapter.emit_notify(info);
            }
        });
    }

    /// Feeds one newline-delimited JSON message received from the
    /// resource manager.
    pub async fn handle_line(self: &Arc<Self>, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping malformed signalling message");
                return;
            }
        };
        match value.get("event").and_then(|v| v.as_str()) {
            Some("start_record") => self.handle_start_record(&value).await,
            Some("stop_record") => self.handle_stop_record(&value),
            Some("list_running_recordings") => self.handle_list_running(),
            Some("shutdown") => self.handle_shutdown(),
            Some(other) => warn!(event = other, "unknown recorder event, dropping"),
            None => warn!("signalling message missing 'event' field, dropping"),
        }
    }

    async fn handle_start_record(self: &Arc<Self>, value: &Value) {
        let req = value.get("request").cloned().unwrap_or(Value::Null);
        let (Some(mc_ip), Some(mc_port), Some(loop_name)) = (
            req.get("mc_ip").and_then(|v| v.as_str()),
            req.get("mc_port").and_then(|v| v.as_u64()),
            req.get("loop").and_then(|v| v.as_str()),
        ) else {
            self.send_error("start_record", 400, "mc_ip, mc_port and loop are required");
            return;
        };
        let id = req
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let roll_after_secs = req.get("roll_after_secs").and_then(|v| v.as_u64());
        let codec_spec = req.get("codec_spec").and_then(|v| v.as_str()).unwrap_or("l16");

        let codec = match codec_for_spec(codec_spec) {
            Ok(c) => c,
            Err(e) => {
                self.send_error("start_record", 400, &e.to_string());
                return;
            }
        };

        let ssrc = self.next_ssrc.fetch_add(1, Ordering::SeqCst);
        // 20ms RTP ptime is the near-universal convention for the G.711/
        // Opus payloads this recorder handles.
        let num_frames_to_roll_after = roll_after_secs.map(|secs| secs * 1000 / 20).unwrap_or(0);

        let entry = StreamEntry {
            id,
            ssrc,
            loop_name: loop_name.to_string(),
            root: self.config.root.clone(),
            ext: self.config.default_ext.clone(),
            sample_rate_hz: self.config.sample_rate_hz,
            source_codec: codec,
            sink: None,
            file_name: None,
            start_epoch_secs: None,
            pcm_chunker: Default::default(),
            vad: self.config.default_vad,
            frames_to_buffer: self.config.frames_to_buffer,
            silence_cutoff_frames: self.config.silence_cutoff_frames,
            silent_frames_seen: 0,
            frames_since_roll_reset: 0,
            num_frames_to_roll_after,
            roll_counter: 0,
            frame_counter: lib_common::RateCounter::new(std::time::Instant::now()),
        };

        if let Err(e) = self.table.start(id, ssrc, entry) {
            self.send_error("start_record", 409, &e.to_string());
            return;
        }

        match spawn_multicast_ingest(mc_ip, mc_port as u16, ssrc, Arc::clone(&self.pool)).await {
            Ok(task) => {
                self.ingest.lock().unwrap().insert(id, Ingest { task });
            }
            Err(e) => {
                self.table.remove(id);
                self.send_error("start_record", 500, &e.to_string());
                return;
            }
        }

        self.send(&json!({
            "event": "start_record",
            "response": { "id": id.to_string(), "filename": "Unknown yet" },
        }));
    }

    fn handle_stop_record(&self, value: &Value) {
        let req = value.get("request").cloned().unwrap_or(Value::Null);
        let Some(id) = req.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok()) else {
            self.send_error("stop_record", 400, "id is required");
            return;
        };
        if let Some(ingest) = self.ingest.lock().unwrap().remove(&id) {
            ingest.task.abort();
        }
        // Unknown id: idempotent success, per the error policy table.
        if let Some(entry) = self.table.remove(id) {
            let mut guard = entry.lock();
            if let Ok(Some(info)) = pipeline::close_recording(&mut guard, now_epoch_secs()) {
                drop(guard);
                self.emit_notify(info);
            }
        }
        self.send(&json!({ "event": "stop_record", "response": {} }));
    }

    fn handle_list_running(&self) {
        let mut map = serde_json::Map::new();
        for (id, ssrc) in self.table.list_running() {
            map.insert(id.to_string(), json!(ssrc));
        }
        self.send(&json!({ "event": "list_running_recordings", "response": Value::Object(map) }));
    }

    fn handle_shutdown(self: &Arc<Self>) {
        self.send(&json!({ "event": "shutdown", "response": {} }));
        self.shutdown.notify_one();
    }

    fn emit_notify(&self, info: RecordingInfo) {
        self.send(&json!({
            "event": "notify_new_recording",
            "parameter": {
                "id": info.id.to_string(),
                "loop": info.loop_name,
                "filename": info.file_name.to_string_lossy(),
                "start_epoch": info.start_epoch_secs,
                "end_epoch": info.end_epoch_secs,
            },
        }));
    }

    fn send_error(&self, event: &str, code: i64, message: &str) {
        self.send(&json!({
            "event": event,
            "response": { "error": { "code": code, "message": message } },
        }));
    }

    fn send(&self, value: &Value) {
        let Some(conn) = self.outbound.lock().unwrap().clone() else {
            warn!("no outbound connection to resource manager yet, dropping message");
            return;
        };
        let mut bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize signalling message");
                return;
            }
        };
        bytes.push(b'\n');
        tokio::spawn(async move {
            conn.send(Bytes::from(bytes), None).await;
        });
    }
}

/// Binds a UDP socket on `mc_port`, joins the `mc_ip` multicast group, and
/// spawns a task parsing each datagram as an RTP packet (via `rtp-rs`,
/// the codec factory's declared external collaborator) and forwarding it
/// to the worker pool under `ssrc` — the internal identifier this
/// recording was started with, not necessarily the wire SSRC.
async fn spawn_multicast_ingest(mc_ip: &str, mc_port: u16, ssrc: u32, pool: Arc<WorkerPool>) -> crate::error::RecorderResult<JoinHandle<()>> {
    let group: Ipv4Addr = mc_ip
        .parse()
        .map_err(|_| crate::error::RecorderError::InvalidPath(mc_ip.to_string()))?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, mc_port)).await?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;

    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => match rtp_rs::RtpReader::new(&buf[..n]) {
                    Ok(reader) => {
                        let msg = RtpMessage {
                            ssrc,
                            seq: u16::from(reader.sequence_number()),
                            payload: Bytes::copy_from_slice(reader.payload()),
                        };
                        pool.dispatch(msg);
                    }
                    Err(_) => warn!(ssrc, "dropping malformed RTP packet"),
                },
                Err(e) => {
                    warn!(ssrc, error = %e, "multicast socket read failed, stopping ingest");
                    break;
                }
            }
        }
    }))
}

fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> SignallingConfig {
        SignallingConfig {
            root: dir.to_path_buf(),
            default_vad: VadParams { zero_cross_hz_threshold: 0.0, power_db_threshold: 0.0, sample_rate_hz: 8000 },
            frames_to_buffer: 1,
            silence_cutoff_frames: 20,
            sample_rate_hz: 8000,
            default_ext: "wav".into(),
        }
    }

    #[tokio::test]
    async fn stop_on_unknown_id_replies_success_without_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(StreamTable::default());
        let (stopped_tx, _rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::spawn(1, Arc::clone(&table), stopped_tx));
        let adapter = SignallingAdapter::new(table, pool, test_config(dir.path()));
        adapter.handle_line(r#"{"event":"stop_record","request":{"id":"00000000-0000-0000-0000-000000000000"}}"#).await;
    }

    #[tokio::test]
    async fn list_running_on_an_empty_table_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(StreamTable::default());
        let (stopped_tx, _rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::spawn(1, Arc::clone(&table), stopped_tx));
        let adapter = SignallingAdapter::new(table, pool, test_config(dir.path()));
        adapter.handle_line(r#"{"event":"list_running_recordings"}"#).await;
    }

    #[tokio::test]
    async fn start_record_without_required_fields_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(StreamTable::default());
        let (stopped_tx, _rx) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkerPool::spawn(1, Arc::clone(&table), stopped_tx));
        let adapter = SignallingAdapter::new(Arc::clone(&table), pool, test_config(dir.path()));
        adapter.handle_line(r#"{"event":"start_record","request":{}}"#).await;
        assert!(table.list_running().is_empty());
    }
}
