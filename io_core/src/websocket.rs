//! # Websocket engine (C6)
//!
//! Hand-rolled RFC 6455 frame parsing, masking, fragmentation assembly
//! and control-frame handling, plus the handshake's
//! `Sec-WebSocket-Accept` computation. Hand-rolled rather than delegated
//! to `tokio-tungstenite` (which the teacher uses only as an outbound
//! client, see `lib_common/src/ingestors/yahoo_wss.rs`) because the
//! allowed-fragment-sequence invariant and the ≤500-byte JSON chunking
//! contract (SPEC_FULL.md §3, §4.3) are first-class requirements here,
//! not incidental behaviour of a third-party parser.

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{IoError, IoResult};

/// The fixed GUID RFC 6455 mandates for the handshake accept-key
/// computation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Frame opcode, per RFC 6455 §5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(b: u8) -> IoResult<Opcode> {
        match b {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(IoError::WsProtocol(format!("unknown opcode {other:#x}"))),
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One fully parsed frame header + payload.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Result of attempting to parse one frame out of a buffer.
pub enum FrameParseOutcome {
    /// Not enough bytes yet.
    Progress,
    /// One frame parsed; `consumed` bytes should be dropped from the
    /// front of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// Malformed frame; close the connection.
    Error(String),
}

/// Parses one websocket frame (client→server, so always masked per RFC
/// 6455 §5.1) from the front of `buf`.
pub fn parse_frame(buf: &[u8]) -> FrameParseOutcome {
    if buf.len() < 2 {
        return FrameParseOutcome::Progress;
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let opcode = match Opcode::from_u8(b0 & 0x0F) {
        Ok(o) => o,
        Err(e) => return FrameParseOutcome::Error(e.to_string()),
    };
    let masked = b1 & 0x80 != 0;
    if !masked {
        return FrameParseOutcome::Error("client frames must be masked".into());
    }
    let mut offset = 2usize;
    let len7 = (b1 & 0x7F) as u64;
    let payload_len: u64 = if len7 == 126 {
        if buf.len() < offset + 2 {
            return FrameParseOutcome::Progress;
        }
        let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u64;
        offset += 2;
        len
    } else if len7 == 127 {
        if buf.len() < offset + 8 {
            return FrameParseOutcome::Progress;
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&buf[offset..offset + 8]);
        offset += 8;
        u64::from_be_bytes(arr)
    } else {
        len7
    };
    if buf.len() < offset + 4 {
        return FrameParseOutcome::Progress;
    }
    let mask = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
    offset += 4;
    let payload_len = payload_len as usize;
    if buf.len() < offset + payload_len {
        return FrameParseOutcome::Progress;
    }
    let mut payload = buf[offset..offset + payload_len].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    let consumed = offset + payload_len;
    if opcode.is_control() && payload_len > 125 {
        return FrameParseOutcome::Error("control frame payload too large".into());
    }
    FrameParseOutcome::Frame {
        frame: Frame { fin, opcode, payload },
        consumed,
    }
}

/// Builds an unmasked server→client frame (RFC 6455 §5.1: the server
/// never masks).
pub fn build_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    let opcode_byte = match opcode {
        Opcode::Continuation => 0x0,
        Opcode::Text => 0x1,
        Opcode::Binary => 0x2,
        Opcode::Close => 0x8,
        Opcode::Ping => 0x9,
        Opcode::Pong => 0xA,
    };
    out.push((if fin { 0x80 } else { 0x00 }) | opcode_byte);
    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Tracks the in-progress defragmentation of TEXT/BINARY frames. Enforces
/// the allowed sequence invariant of SPEC_FULL.md §3:
/// `ε | TEXT|BINARY | (TEXT|BINARY)·CONT*·CONT_FIN`.
#[derive(Default)]
pub struct FragmentAssembler {
    in_progress: Option<(Opcode, Vec<u8>, usize)>,
    /// Optional cap on the number of CONT frames before a sequence is
    /// considered oversized and aborted (SPEC_FULL.md §4.3).
    pub max_fragments: Option<usize>,
}

/// What the assembler produced for one inbound data frame.
pub enum AssembledMessage {
    /// Still accumulating; nothing to deliver yet.
    Pending,
    /// A complete message (possibly the only fragment) is ready.
    Complete { opcode: Opcode, payload: Vec<u8> },
}

impl FragmentAssembler {
    /// Feeds one data frame (TEXT, BINARY, or CONTINUATION) into the
    /// assembler.
    pub fn feed(&mut self, frame: Frame) -> IoResult<AssembledMessage> {
        match (frame.opcode, &mut self.in_progress) {
            (Opcode::Text, None) | (Opcode::Binary, None) => {
                if frame.fin {
                    return Ok(AssembledMessage::Complete {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    });
                }
                self.in_progress = Some((frame.opcode, frame.payload, 0));
                Ok(AssembledMessage::Pending)
            }
            (Opcode::Continuation, Some((_, buf, count))) => {
                buf.extend_from_slice(&frame.payload);
                *count += 1;
                if let Some(max) = self.max_fragments {
                    if *count > max {
                        self.in_progress = None;
                        return Err(IoError::WsProtocol("fragment count exceeded maximum".into()));
                    }
                }
                if frame.fin {
                    let (opcode, payload, _) = self.in_progress.take().unwrap();
                    Ok(AssembledMessage::Complete { opcode, payload })
                } else {
                    Ok(AssembledMessage::Pending)
                }
            }
            (Opcode::Text, Some(_)) | (Opcode::Binary, Some(_)) => {
                self.in_progress = None;
                Err(IoError::WsProtocol(
                    "new data frame started before previous fragment sequence finished".into(),
                ))
            }
            (Opcode::Continuation, None) => Err(IoError::WsProtocol(
                "continuation frame with no fragment sequence in progress".into(),
            )),
            _ => unreachable!("control frames are handled separately"),
        }
    }
}

/// Maximum bytes per outbound JSON chunk frame, per SPEC_FULL.md §4.3.
pub const JSON_CHUNK_SIZE: usize = 500;

/// Serializes `value` and splits it into one or more TEXT/CONT frames of
/// at most [`JSON_CHUNK_SIZE`] bytes each, per the JSON/event adapter's
/// send contract.
pub fn chunk_json(value: &serde_json::Value) -> IoResult<Vec<Vec<u8>>> {
    let text = serde_json::to_vec(value).map_err(IoError::Json)?;
    if text.len() <= JSON_CHUNK_SIZE {
        return Ok(vec![build_frame(true, Opcode::Text, &text)]);
    }
    let mut frames = Vec::new();
    let mut chunks = text.chunks(JSON_CHUNK_SIZE);
    let first = chunks.next().unwrap();
    frames.push(build_frame(false, Opcode::Text, first));
    let remaining: Vec<&[u8]> = chunks.collect();
    for (i, chunk) in remaining.iter().enumerate() {
        let is_last = i == remaining.len() - 1;
        frames.push(build_frame(is_last, Opcode::Continuation, chunk));
    }
    Ok(frames)
}

/// A handle a websocket route hands to event handlers so they can reply.
/// Wraps the raw-frame outbound channel; `send_json` serialises and
/// chunks per [`chunk_json`] before pushing each frame down the wire.
#[derive(Clone)]
pub struct JsonSender {
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
}

impl JsonSender {
    /// Wraps an existing outbound-frame channel.
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>) -> JsonSender {
        JsonSender { tx }
    }

    /// Serialises `value`, chunks it per the ≤500-byte contract, and
    /// enqueues every resulting frame.
    pub fn send_json(&self, value: &serde_json::Value) -> IoResult<()> {
        for frame in chunk_json(value)? {
            let _ = self.tx.send(frame);
        }
        Ok(())
    }

    /// Test-only constructor returning a connected sender/receiver pair.
    #[cfg(test)]
    pub fn new_test_pair() -> (JsonSender, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (JsonSender { tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_the_rfc6455_example() {
        // RFC 6455 §1.3's worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    fn mask_payload(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect()
    }

    fn client_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [1, 2, 3, 4];
        let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode, 0x80 | (payload.len() as u8)];
        out.extend_from_slice(&mask);
        out.extend_from_slice(&mask_payload(payload, mask));
        out
    }

    #[test]
    fn fragmented_text_reassembles_to_hello() {
        let mut assembler = FragmentAssembler::default();
        let frames = [
            client_frame(false, 0x1, b"he"),
            client_frame(false, 0x0, b"l"),
            client_frame(true, 0x0, b"lo"),
        ];
        let mut last = None;
        for raw in frames {
            let FrameParseOutcome::Frame { frame, .. } = parse_frame(&raw) else {
                panic!("expected a full frame");
            };
            last = Some(assembler.feed(frame).unwrap());
        }
        match last.unwrap() {
            AssembledMessage::Complete { opcode, payload } => {
                assert_eq!(opcode, Opcode::Text);
                assert_eq!(payload, b"hello");
            }
            AssembledMessage::Pending => panic!("expected Complete"),
        }
    }

    #[test]
    fn a_second_start_frame_mid_sequence_is_a_protocol_violation() {
        let mut assembler = FragmentAssembler::default();
        let FrameParseOutcome::Frame { frame, .. } = parse_frame(&client_frame(false, 0x1, b"he"))
        else {
            panic!()
        };
        assembler.feed(frame).unwrap();
        let FrameParseOutcome::Frame { frame, .. } = parse_frame(&client_frame(true, 0x1, b"oops"))
        else {
            panic!()
        };
        assert!(assembler.feed(frame).is_err());
    }

    #[test]
    fn json_payload_over_the_chunk_size_splits_into_cont_frames() {
        let big = serde_json::json!({ "data": "x".repeat(1200) });
        let frames = chunk_json(&big).unwrap();
        assert!(frames.len() > 1);
        // First byte's opcode nibble is TEXT (0x1) with FIN=0.
        assert_eq!(frames[0][0] & 0x0F, 0x1);
        assert_eq!(frames[0][0] & 0x80, 0);
        // Last frame is a CONT with FIN=1.
        let last = frames.last().unwrap();
        assert_eq!(last[0] & 0x0F, 0x0);
        assert_eq!(last[0] & 0x80, 0x80);
    }
}
