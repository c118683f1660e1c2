//! # Recorder pipeline (C10)
//!
//! The per-frame decode → chunk → VAD → write state machine, executed
//! under the owning `StreamEntry`'s lock. Implements the eight-step
//! branch described in SPEC_FULL.md §4.4 verbatim.

use uuid::Uuid;

use crate::error::RecorderResult;
use crate::paths::recording_file_path;
use crate::sink::{OggOpusSink, OutputSink, WavSink};
use crate::stream_table::{RecordingInfo, StreamEntry};
use crate::vad::is_voice;

/// Runs one RTP frame through the pipeline. Returns every recording
/// that was closed as a result (silence cutoff and/or rolling may each
/// close a file within the same call).
pub fn process_frame(
    entry: &mut StreamEntry,
    seq: u16,
    payload: &[u8],
    now_epoch_secs: u64,
) -> RecorderResult<Vec<RecordingInfo>> {
    let mut closed = Vec::new();
    entry.frame_counter.increment(1, std::time::Instant::now());

    // 2. Decode.
    let pcm = match entry.source_codec.decode(seq, payload) {
        Ok(pcm) => pcm,
        // Codec decode error: drop frame, continue pipeline (SPEC_FULL.md §7).
        Err(_) => return Ok(closed),
    };

    // 3. Append to chunker.
    entry.pcm_chunker.push_back(pcm);

    // 4. Wait for the look-ahead window to fill.
    if entry.pcm_chunker.len() < entry.frames_to_buffer.max(1) as usize {
        return Ok(closed);
    }

    // 5. Evaluate VAD over the whole buffered window.
    let window: Vec<i16> = entry.pcm_chunker.iter().flatten().copied().collect();
    let voice_detected = is_voice(&window, &entry.vad);

    // 6. Pop one frame's worth of PCM — the earliest frame, now resolved.
    let Some(frame_pcm) = entry.pcm_chunker.pop_front() else {
        return Ok(closed);
    };

    // 7. Branch on (recording-open, voice-detected).
    let recording_open = entry.sink.is_some();
    match (recording_open, voice_detected) {
        (false, false) => {
            // Discard popped PCM; idle.
        }
        (false, true) => {
            open_recording(entry, now_epoch_secs)?;
            write_or_drop(entry, &frame_pcm);
            entry.silent_frames_seen = 0;
        }
        (true, true) => {
            write_or_drop(entry, &frame_pcm);
            entry.silent_frames_seen = 0;
        }
        (true, false) => {
            entry.silent_frames_seen += 1;
            write_or_drop(entry, &frame_pcm);
            if entry.silent_frames_seen > entry.silence_cutoff_frames as u64 {
                if let Some(info) = close_recording(entry, now_epoch_secs)? {
                    closed.push(info);
                }
                entry.silent_frames_seen = 0;
            }
        }
    }

    // 8. Rolling: close and let the next voice frame reopen fresh.
    if entry.num_frames_to_roll_after > 0 && entry.sink.is_some() {
        entry.frames_since_roll_reset += 1;
        if entry.frames_since_roll_reset > entry.num_frames_to_roll_after {
            if let Some(info) = close_recording(entry, now_epoch_secs)? {
                closed.push(info);
            }
            entry.frames_since_roll_reset = 0;
        }
    }

    Ok(closed)
}

/// A PCM write error closes the file with an error callback and leaves
/// the recording stopped (SPEC_FULL.md §7); it does not abort the
/// pipeline step itself.
fn write_or_drop(entry: &mut StreamEntry, pcm: &[i16]) {
    if let Some(sink) = entry.sink.as_mut() {
        if let Err(e) = sink.write_chunk(pcm) {
            tracing::warn!(id = %entry.id, error = %e, "pcm write failed, closing recording");
            entry.sink = None;
            entry.file_name = None;
            entry.start_epoch_secs = None;
        }
    }
}

fn open_recording(entry: &mut StreamEntry, now_epoch_secs: u64) -> RecorderResult<()> {
    let id = entry.id;
    let path = recording_file_path(&entry.root, &entry.loop_name, now_epoch_secs, id, &entry.ext)?;
    let sink: Box<dyn OutputSink> = match entry.ext.as_str() {
        "ogg" | "opus" => Box::new(OggOpusSink::create(&path, entry.sample_rate_hz, entry.ssrc)?),
        _ => Box::new(WavSink::create(&path, entry.sample_rate_hz)?),
    };
    entry.sink = Some(sink);
    entry.file_name = Some(path);
    entry.start_epoch_secs = Some(now_epoch_secs);
    entry.frames_since_roll_reset = 0;
    Ok(())
}

/// `pub(crate)` rather than private: the signalling adapter (C13) also
/// needs to force-close a file on an explicit `stop_record`.
pub(crate) fn close_recording(entry: &mut StreamEntry, now_epoch_secs: u64) -> RecorderResult<Option<RecordingInfo>> {
    let Some(mut sink) = entry.sink.take() else {
        return Ok(None);
    };
    sink.close()?;
    tracing::debug!(
        id = %entry.id,
        frames_per_sec = entry.frame_counter.average_per_sec(std::time::Instant::now()),
        "recording closed"
    );
    let info = entry.file_name.take().zip(entry.start_epoch_secs.take()).map(|(file_name, start)| RecordingInfo {
        id: entry.id,
        loop_name: entry.loop_name.clone(),
        file_name,
        start_epoch_secs: start,
        end_epoch_secs: now_epoch_secs,
    });
    Ok(info)
}

/// Not otherwise exercised from outside this module, but kept importable
/// for tests/bin setup that need a fresh id for a newly started stream.
pub fn new_stream_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Pcm16Codec;
    use crate::vad::VadParams;
    use std::path::PathBuf;

    fn test_entry(dir: &std::path::Path, silence_cutoff: u32) -> StreamEntry {
        StreamEntry {
            id: Uuid::new_v4(),
            ssrc: 1,
            loop_name: "main".into(),
            root: dir.to_path_buf(),
            ext: "wav".into(),
            sample_rate_hz: 8000,
            source_codec: Box::new(Pcm16Codec),
            sink: None,
            file_name: None,
            start_epoch_secs: None,
            pcm_chunker: Default::default(),
            // Voice/silence is controlled per test via the payload's PCM
            // amplitude, with both thresholds active (neither is 0, or
            // VAD would bypass entirely).
            vad: VadParams { zero_cross_hz_threshold: 50.0, power_db_threshold: -20.0, sample_rate_hz: 8000 },
            frames_to_buffer: 1,
            silence_cutoff_frames: silence_cutoff,
            silent_frames_seen: 0,
            frames_since_roll_reset: 0,
            num_frames_to_roll_after: 0,
            roll_counter: 0,
            frame_counter: lib_common::RateCounter::new(std::time::Instant::now()),
        }
    }

    fn silent_frame() -> Vec<u8> {
        vec![0u8; 320] // 160 i16 samples of silence, big-endian L16
    }

    fn voice_frame() -> Vec<u8> {
        // A loud alternating-sign tone: well above the power threshold.
        let mut bytes = Vec::with_capacity(320);
        for i in 0..160u16 {
            let sample: i16 = if i % 2 == 0 { 20_000 } else { -20_000 };
            bytes.extend_from_slice(&sample.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn silence_alone_never_opens_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry(dir.path(), 20);
        for seq in 0..50u16 {
            let closed = process_frame(&mut entry, seq, &silent_frame(), 1_700_000_000).unwrap();
            assert!(closed.is_empty());
        }
        assert!(entry.sink.is_none());
    }

    #[test]
    fn voice_then_trailing_silence_opens_and_closes_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry(dir.path(), 20);
        let mut seq = 0u16;
        let mut closed_events: Vec<RecordingInfo> = Vec::new();

        for _ in 0..50 {
            closed_events.extend(process_frame(&mut entry, seq, &silent_frame(), 1_700_000_000).unwrap());
            seq += 1;
        }
        assert!(entry.sink.is_none());

        for _ in 0..200 {
            closed_events.extend(process_frame(&mut entry, seq, &voice_frame(), 1_700_000_100).unwrap());
            seq += 1;
        }
        assert!(entry.sink.is_some());

        for _ in 0..40 {
            closed_events.extend(process_frame(&mut entry, seq, &silent_frame(), 1_700_000_200).unwrap());
            seq += 1;
        }

        assert_eq!(closed_events.len(), 1);
        assert!(entry.sink.is_none());
    }

    #[test]
    fn rolling_closes_and_frees_the_entry_for_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry(dir.path(), 1000);
        entry.num_frames_to_roll_after = 5;
        let mut seq = 0u16;
        let mut closed_events: Vec<RecordingInfo> = Vec::new();
        for _ in 0..20 {
            closed_events.extend(process_frame(&mut entry, seq, &voice_frame(), 1_700_000_000).unwrap());
            seq += 1;
        }
        assert!(!closed_events.is_empty());
    }

    #[test]
    fn file_lands_under_the_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = test_entry(dir.path(), 20);
        process_frame(&mut entry, 0, &voice_frame(), 1_700_000_000).unwrap();
        let file_name: PathBuf = entry.file_name.clone().unwrap();
        assert!(file_name.starts_with(dir.path()));
    }
}
