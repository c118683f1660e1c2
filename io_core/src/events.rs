//! # Event engine (C8)
//!
//! A finite, small-key hash map from event name to handler (SPEC_FULL.md
//! §9: "unbounded dynamic callback tables... are finite hash maps keyed
//! by small strings"), with O(1) expected dispatch. Resolves the Open
//! Question about `ov_event_engine_push`'s two incompatible signatures
//! by adopting the wider one: every handler receives an explicit
//! `userdata` alongside the socket and payload.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{IoError, IoResult};
use crate::websocket::JsonSender;

/// Maximum event-name length accepted by `register`, matching
/// SPEC_FULL.md §9's fixed max key length of 255.
pub const MAX_EVENT_NAME_LEN: usize = 255;

/// A registered event handler. `userdata` is reactor-scoped context the
/// caller installed at registration time (replacing the source's global
/// mutable state, per SPEC_FULL.md §9); `socket` lets the handler reply;
/// `parameter` is the JSON payload's `request`/`parameter`/`response`
/// field (or `Value::Null` if absent).
pub type EventHandler =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>, &JsonSender, serde_json::Value) + Send + Sync>;

/// Name → handler registry.
#[derive(Default)]
pub struct EventEngine {
    handlers: RwLock<HashMap<String, EventHandler>>,
    userdata: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl EventEngine {
    /// Creates an empty registry.
    pub fn new() -> EventEngine {
        EventEngine::default()
    }

    /// Installs the userdata context handed to every dispatched handler.
    pub fn set_userdata(&self, userdata: Arc<dyn Any + Send + Sync>) {
        *self.userdata.write().unwrap() = Some(userdata);
    }

    /// Registers a handler for `name`. Overwrites any existing handler
    /// for the same name.
    pub fn register(&self, name: &str, handler: EventHandler) -> IoResult<()> {
        if name.len() > MAX_EVENT_NAME_LEN {
            return Err(IoError::Parse(format!("event name exceeds {MAX_EVENT_NAME_LEN} bytes")));
        }
        self.handlers.write().unwrap().insert(name.to_string(), handler);
        Ok(())
    }

    /// Parses `message` as a JSON object, extracts its `event` field, and
    /// dispatches to the matching handler with the `request`/`parameter`
    /// field (whichever is present) as payload. An unknown event name is
    /// dropped with a warning, per the error policy table (SPEC_FULL.md
    /// §7): this never closes the connection.
    pub fn dispatch(&self, message: &serde_json::Value, socket: &JsonSender) {
        let Some(event_name) = message.get("event").and_then(|v| v.as_str()) else {
            tracing::warn!("event message missing 'event' field, dropping");
            return;
        };
        let handler = self.handlers.read().unwrap().get(event_name).cloned();
        match handler {
            Some(handler) => {
                let payload = message
                    .get("request")
                    .or_else(|| message.get("parameter"))
                    .or_else(|| message.get("response"))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let userdata = self
                    .userdata
                    .read()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Arc::new(()) as Arc<dyn Any + Send + Sync>);
                handler(userdata, socket, payload);
            }
            None => {
                tracing::warn!(event = event_name, "unknown event, dropping payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn dispatches_to_the_registered_handler() {
        let engine = EventEngine::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        engine
            .register(
                "ping",
                Arc::new(move |_userdata, _socket, _payload| {
                    called_clone.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let (sender, _rx) = JsonSender::new_test_pair();
        engine.dispatch(&serde_json::json!({"event": "ping"}), &sender);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn unknown_event_is_dropped_without_panicking() {
        let engine = EventEngine::new();
        let (sender, _rx) = JsonSender::new_test_pair();
        engine.dispatch(&serde_json::json!({"event": "nonexistent"}), &sender);
    }
}
