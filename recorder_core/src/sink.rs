//! # Output containers
//!
//! The "capability set `{ write_chunk, close }` with variants per
//! layer" called for in SPEC_FULL.md §9 (replacing the source's
//! inheritance-style codec/container layering): [`OutputSink`] is the
//! shared interface; [`WavSink`] wraps `hound`, [`OggOpusSink`]
//! hand-rolls an RFC 7845 Ogg/Opus muxer around the `opus` encoder,
//! since no pure-Rust crate in this workspace's dependency set provides
//! one.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::codec::Pcm;
use crate::error::{RecorderError, RecorderResult};

/// What every concrete output format implements: accept one frame's PCM
/// and, on stop, flush and close the file.
pub trait OutputSink: Send {
    fn write_chunk(&mut self, pcm: &[i16]) -> RecorderResult<()>;
    fn close(&mut self) -> RecorderResult<()>;
}

/// Uncompressed WAV via `hound`.
pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn create(path: &Path, sample_rate_hz: u32) -> RecorderResult<WavSink> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sample_rate_hz,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| RecorderError::Sink(e.to_string()))?;
        Ok(WavSink { writer: Some(writer) })
    }
}

impl OutputSink for WavSink {
    fn write_chunk(&mut self, pcm: &[i16]) -> RecorderResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| RecorderError::Sink("write after close".into()))?;
        for &sample in pcm {
            writer.write_sample(sample).map_err(|e| RecorderError::Sink(e.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) -> RecorderResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(|e| RecorderError::Sink(e.to_string()))?;
        }
        Ok(())
    }
}

/// RFC 7845 Ogg/Opus. Encodes fixed-size PCM frames with `opus::Encoder`
/// and wraps each resulting packet in its own Ogg page — simpler than
/// packing multiple packets per page, at the cost of a little container
/// overhead, which is an acceptable trade for a recorder that is not
/// latency- or bandwidth-constrained.
pub struct OggOpusSink {
    file: BufWriter<File>,
    encoder: opus::Encoder,
    serial: u32,
    sequence: u32,
    granule_position: i64,
    frame_size: usize,
    closed: bool,
}

const OPUS_FRAME_MS: u32 = 20;

impl OggOpusSink {
    pub fn create(path: &Path, sample_rate_hz: u32, serial: u32) -> RecorderResult<OggOpusSink> {
        let file = BufWriter::new(File::create(path)?);
        let encoder = opus::Encoder::new(sample_rate_hz, opus::Channels::Mono, opus::Application::Audio)
            .map_err(|e| RecorderError::Sink(e.to_string()))?;
        let frame_size = (sample_rate_hz * OPUS_FRAME_MS / 1000) as usize;

        let mut sink = OggOpusSink {
            file,
            encoder,
            serial,
            sequence: 0,
            granule_position: 0,
            frame_size,
            closed: false,
        };
        sink.write_header_pages(sample_rate_hz)?;
        Ok(sink)
    }

    fn write_header_pages(&mut self, sample_rate_hz: u32) -> RecorderResult<()> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(1); // channel count
        head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&sample_rate_hz.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes()); // output gain
        head.push(0); // channel mapping family
        self.write_page(&head, 0, true, false)?;

        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        let vendor = b"recorder_core";
        tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        tags.extend_from_slice(vendor);
        tags.extend_from_slice(&0u32.to_le_bytes()); // zero user comments
        self.write_page(&tags, 0, false, false)?;
        Ok(())
    }

    fn write_page(&mut self, packet: &[u8], granule_position: i64, bos: bool, eos: bool) -> RecorderResult<()> {
        // One packet per page: a single lacing-table entry run of 255s
        // followed by the remainder, per RFC 3533 §6.
        let mut segments = Vec::new();
        let mut remaining = packet.len();
        while remaining >= 255 {
            segments.push(255u8);
            remaining -= 255;
        }
        segments.push(remaining as u8);

        let mut header = Vec::with_capacity(27 + segments.len());
        header.extend_from_slice(b"OggS");
        header.push(0); // stream structure version
        let header_type = (bos as u8) | ((eos as u8) << 2);
        header.push(header_type);
        header.extend_from_slice(&granule_position.to_le_bytes());
        header.extend_from_slice(&self.serial.to_le_bytes());
        header.extend_from_slice(&self.sequence.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // CRC placeholder
        header.push(segments.len() as u8);
        header.extend_from_slice(&segments);

        let mut page = header;
        page.extend_from_slice(packet);
        let crc = ogg_crc32(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(&page)?;
        self.sequence += 1;
        Ok(())
    }
}

impl OutputSink for OggOpusSink {
    fn write_chunk(&mut self, pcm: &[i16]) -> RecorderResult<()> {
        for frame in pcm.chunks(self.frame_size) {
            // The encoder requires a full frame; pad the final partial
            // frame with silence rather than drop it.
            let mut padded;
            let input: &[i16] = if frame.len() == self.frame_size {
                frame
            } else {
                padded = frame.to_vec();
                padded.resize(self.frame_size, 0);
                &padded
            };
            let mut out = vec![0u8; 4000];
            let len = self
                .encoder
                .encode(input, &mut out)
                .map_err(|e| RecorderError::Sink(e.to_string()))?;
            out.truncate(len);
            self.granule_position += self.frame_size as i64;
            self.write_page(&out, self.granule_position, false, false)?;
        }
        Ok(())
    }

    fn close(&mut self) -> RecorderResult<()> {
        if !self.closed {
            self.write_page(&[], self.granule_position, false, true)?;
            self.file.flush()?;
            self.closed = true;
        }
        Ok(())
    }
}

const CRC_POLY: u32 = 0x04c11db7;

fn ogg_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ CRC_POLY } else { crc << 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// The unreflected CRC-32 variant RFC 3533 mandates for Ogg page
/// checksums (not the common zlib/PNG reflected variant).
fn ogg_crc32(data: &[u8]) -> u32 {
    let table = ogg_crc_table();
    let mut crc: u32 = 0;
    for &byte in data {
        crc = (crc << 8) ^ table[(((crc >> 24) ^ byte as u32) & 0xFF) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_sink_writes_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavSink::create(&path, 8000).unwrap();
        sink.write_chunk(&[1, -1, 2, -2]).unwrap();
        sink.close().unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
    }

    #[test]
    fn crc32_of_empty_input_is_zero() {
        assert_eq!(ogg_crc32(&[]), 0);
    }
}
