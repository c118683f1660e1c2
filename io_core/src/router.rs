//! # Web router (C7)
//!
//! Dispatches HTTP requests and websocket events to user-registered
//! handlers, keyed by `(host, uri)`. A websocket route's handler is an
//! [`EventEngine`] — the JSON/event adapter described in SPEC_FULL.md
//! §4.3: a received TEXT payload is parsed as JSON, its `event` field
//! looked up, and the matching handler invoked with `(userdata, socket,
//! parameter, json)`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{IoError, IoResult};
use crate::events::EventEngine;
use crate::http::HttpRequest;

/// A plain-HTTP (non-websocket) handler.
pub type HttpHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// What an `HttpHandler` returns; the router serialises this into a
/// status line + headers + body.
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A `200 OK` response with the given body.
    pub fn ok(body: Vec<u8>) -> HttpResponse {
        HttpResponse {
            status: 200,
            reason: "OK",
            body,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            self.status,
            self.reason,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// What a `(host, uri)` pair resolves to.
#[derive(Clone)]
pub enum RouteTarget {
    Http(HttpHandler),
    WebSocket(Arc<EventEngine>),
}

/// Key a route is registered under. `host` matches the SNI-resolved
/// domain name (or the plain-HTTP `Host` header when there is no TLS);
/// an empty host matches any domain not otherwise registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    host: String,
    uri: String,
}

/// The per-host, per-URI dispatch table.
#[derive(Default)]
pub struct WebRouter {
    routes: RwLock<HashMap<RouteKey, RouteTarget>>,
}

impl WebRouter {
    /// Creates an empty router.
    pub fn new() -> WebRouter {
        WebRouter::default()
    }

    /// Registers a plain HTTP handler for `(host, uri)`.
    pub fn register_http(&self, host: &str, uri: &str, handler: HttpHandler) {
        self.routes.write().unwrap().insert(
            RouteKey {
                host: host.to_string(),
                uri: uri.to_string(),
            },
            RouteTarget::Http(handler),
        );
    }

    /// Registers a websocket route backed by an [`EventEngine`].
    pub fn register_websocket(&self, host: &str, uri: &str, engine: Arc<EventEngine>) {
        self.routes.write().unwrap().insert(
            RouteKey {
                host: host.to_string(),
                uri: uri.to_string(),
            },
            RouteTarget::WebSocket(engine),
        );
    }

    /// Resolves `(host, uri)` to a registered target, falling back to an
    /// empty-host wildcard entry if no exact host match exists.
    pub fn resolve(&self, host: &str, uri: &str) -> Option<RouteTarget> {
        let routes = self.routes.read().unwrap();
        if let Some(target) = routes.get(&RouteKey {
            host: host.to_string(),
            uri: uri.to_string(),
        }) {
            return Some(target.clone());
        }
        routes
            .get(&RouteKey {
                host: String::new(),
                uri: uri.to_string(),
            })
            .cloned()
    }

    /// Dispatches a parsed HTTP request: resolves `(host, uri)` and
    /// either upgrades to websocket (caller handles the `101` and mode
    /// switch) or runs the plain HTTP handler.
    pub fn dispatch_http(&self, host: &str, request: &HttpRequest) -> IoResult<HttpResponse> {
        match self.resolve(host, &request.path) {
            Some(RouteTarget::Http(handler)) => Ok(handler(request)),
            Some(RouteTarget::WebSocket(_)) => Err(IoError::Parse(format!(
                "{} is a websocket route; use the upgrade path",
                request.path
            ))),
            None => Ok(HttpResponse {
                status: 404,
                reason: "Not Found",
                body: b"not found".to_vec(),
            }),
        }
    }

    /// Resolves the `EventEngine` a websocket upgrade at `(host, uri)`
    /// should be bound to, if any.
    pub fn websocket_engine(&self, host: &str, uri: &str) -> Option<Arc<EventEngine>> {
        match self.resolve(host, uri) {
            Some(RouteTarget::WebSocket(engine)) => Some(engine),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpParseState;

    fn parse_one(raw: &[u8]) -> HttpRequest {
        let mut state = HttpParseState::default();
        match state.feed(raw) {
            crate::http::ParseOutcome::Success { request, .. } => request,
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn falls_back_to_wildcard_host() {
        let router = WebRouter::new();
        router.register_http("", "/status", Arc::new(|_| HttpResponse::ok(b"up".to_vec())));
        let req = parse_one(b"GET /status HTTP/1.1\r\nHost: anything.test\r\n\r\n");
        let resp = router.dispatch_http("anything.test", &req).unwrap();
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn unregistered_uri_returns_404() {
        let router = WebRouter::new();
        let req = parse_one(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");
        let resp = router.dispatch_http("x", &req).unwrap();
        assert_eq!(resp.status, 404);
    }
}
