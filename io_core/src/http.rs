//! # HTTP framer (C5)
//!
//! Incremental HTTP/1.1 request parsing over a per-connection input
//! accumulator, using `httparse` as a zero-copy tokenizer. `httparse`
//! parses one message's worth of bytes it is handed; the
//! `PROGRESS`/`SUCCESS`/`ERROR` state machine and "trailing bytes become
//! the next message" behaviour described in SPEC_FULL.md §4.3 is this
//! module's own logic layered on top, since `httparse` does not manage
//! a persistent buffer across partial deliveries itself.

use std::collections::HashMap;

use crate::error::{IoError, IoResult};

/// A fully parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    /// True if this request is a well-formed RFC 6455 websocket upgrade:
    /// `Upgrade: websocket`, `Connection` containing `Upgrade`, and a
    /// present `Sec-WebSocket-Key`.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade_ok = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection_ok = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade_ok && connection_ok && self.header("sec-websocket-key").is_some()
    }
}

/// Result of one incremental parse attempt.
pub enum ParseOutcome {
    /// Not enough bytes yet; keep buffering.
    Progress,
    /// One complete message was parsed; `consumed` bytes should be
    /// dropped from the front of the accumulator (the remainder starts
    /// the next message).
    Success { request: HttpRequest, consumed: usize },
    /// The bytes are not a valid HTTP/1.1 message; close the connection.
    Error(String),
}

/// Per-connection HTTP parsing state: just the accumulator, since
/// `httparse` itself is stateless across calls.
#[derive(Default)]
pub struct HttpParseState {
    accumulator: Vec<u8>,
}

const MAX_HEADERS: usize = 64;
/// Refuse to keep buffering a request whose headers alone exceed this —
/// an unbounded accumulator would let a slow-loris client exhaust memory.
const MAX_HEADER_BYTES: usize = 64 * 1024;

impl HttpParseState {
    /// Appends newly delivered bytes and attempts to parse one complete
    /// request. Call repeatedly (draining `Success`/`Error` then calling
    /// again on the remainder) until `Progress` is returned.
    pub fn feed(&mut self, bytes: &[u8]) -> ParseOutcome {
        self.accumulator.extend_from_slice(bytes);
        self.try_parse()
    }

    /// Drains and returns whatever bytes are left in the accumulator,
    /// e.g. when a websocket upgrade leaves frame bytes pipelined right
    /// after the handshake request.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.accumulator)
    }

    fn try_parse(&mut self) -> ParseOutcome {
        if self.accumulator.len() > MAX_HEADER_BYTES {
            return ParseOutcome::Error("request headers exceeded maximum size".into());
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&self.accumulator) {
            Ok(httparse::Status::Complete(header_len)) => {
                let content_length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let total_len = header_len + content_length;
                if self.accumulator.len() < total_len {
                    return ParseOutcome::Progress;
                }
                let mut header_map = HashMap::new();
                for h in req.headers.iter() {
                    if h.name.is_empty() {
                        continue;
                    }
                    header_map.insert(
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    );
                }
                let request = HttpRequest {
                    method: req.method.unwrap_or("").to_string(),
                    path: req.path.unwrap_or("/").to_string(),
                    version: req.version.unwrap_or(1),
                    headers: header_map,
                    body: self.accumulator[header_len..total_len].to_vec(),
                };
                self.accumulator.drain(..total_len);
                ParseOutcome::Success {
                    request,
                    consumed: total_len,
                }
            }
            Ok(httparse::Status::Partial) => ParseOutcome::Progress,
            Err(e) => ParseOutcome::Error(e.to_string()),
        }
    }
}

/// Builds the `101 Switching Protocols` response for an accepted
/// websocket upgrade, per RFC 6455 §4.2.2.
pub fn upgrade_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    )
    .into_bytes()
}

/// Builds a minimal error response, used to reject malformed or
/// unroutable requests before closing the connection.
pub fn error_response(status: u16, reason: &str) -> Vec<u8> {
    let body = reason.as_bytes();
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes()
}

/// Parses a Sec-WebSocket-Key-less plain request body as JSON — a small
/// helper shared by the router for non-websocket JSON endpoints.
pub fn parse_json_body(request: &HttpRequest) -> IoResult<serde_json::Value> {
    serde_json::from_slice(&request.body).map_err(IoError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get_request() {
        let mut state = HttpParseState::default();
        let raw = b"GET /status HTTP/1.1\r\nHost: example.test\r\n\r\n";
        match state.feed(raw) {
            ParseOutcome::Success { request, consumed } => {
                assert_eq!(request.method, "GET");
                assert_eq!(request.path, "/status");
                assert_eq!(consumed, raw.len());
            }
            _ => panic!("expected Success"),
        }
    }

    #[test]
    fn incomplete_request_reports_progress() {
        let mut state = HttpParseState::default();
        match state.feed(b"GET /status HTTP/1.1\r\nHost: ex") {
            ParseOutcome::Progress => {}
            _ => panic!("expected Progress"),
        }
    }

    #[test]
    fn trailing_bytes_start_the_next_message() {
        let mut state = HttpParseState::default();
        let two = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let first = state.feed(two);
        let ParseOutcome::Success { request, .. } = first else {
            panic!("expected Success")
        };
        assert_eq!(request.path, "/a");
        let second = state.try_parse();
        let ParseOutcome::Success { request, .. } = second else {
            panic!("expected Success for second message")
        };
        assert_eq!(request.path, "/b");
    }

    #[test]
    fn detects_websocket_upgrade_headers() {
        let mut state = HttpParseState::default();
        let raw = b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let ParseOutcome::Success { request, .. } = state.feed(raw) else {
            panic!("expected Success")
        };
        assert!(request.is_websocket_upgrade());
    }
}
