//! # Event Model
//!
//! The provider-agnostic vocabulary shared by adapters and sessions, plus the
//! JSON shapes exchanged with the client.
//!
//! ## Message Format:
//! - **Client → Server**: Binary PCM-16 chunks, and `{"event": "stop"}` text control
//! - **Server → Client**: One-key JSON objects such as `{"partial": "..."}`
//!   or `{"final": "..."}`; the byte-count session adds
//!   `{"done": true, "total_bytes": n}`

use serde_json::{json, Value};

/// One decoded unit of provider output, in the order the provider sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Provisional text for the segment currently being spoken.
    Partial(String),
    /// Committed text; appended to the session transcript.
    Final(String),
    /// The provider message verbatim, for diagnostics.
    Raw(Value),
    /// The upstream connection ended.
    Closed,
    /// The provider reported a failure.
    Error(String),
}

/// Messages sent to the client as JSON text frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    System(String),
    Partial(String),
    FinalChunk(String),
    ProviderEvent(Value),
    Error(String),
    Final(String),
    Bytes(u64),
    Done { total_bytes: u64 },
}

impl ServerMessage {
    pub fn to_value(&self) -> Value {
        match self {
            ServerMessage::System(text) => json!({ "system": text }),
            ServerMessage::Partial(text) => json!({ "partial": text }),
            ServerMessage::FinalChunk(text) => json!({ "final_chunk": text }),
            ServerMessage::ProviderEvent(event) => json!({ "sm_event": event }),
            ServerMessage::Error(reason) => json!({ "error": reason }),
            ServerMessage::Final(text) => json!({ "final": text }),
            ServerMessage::Bytes(total) => json!({ "bytes": total }),
            ServerMessage::Done { total_bytes } => json!({
                "done": true,
                "total_bytes": total_bytes
            }),
        }
    }

    /// Serialized form written to the text frame.
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

/// Control messages a client may send as text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientControl {
    Stop,
}

impl ClientControl {
    /// Parse a text frame.
    ///
    /// Accepts `{"event": "stop"}` and the web client's
    /// `{"type": "control", "action": "stop"}`. Anything else, including text
    /// that is not JSON at all, yields `None` and is ignored by the caller.
    pub fn parse(text: &str) -> Option<Self> {
        let msg: Value = serde_json::from_str(text).ok()?;

        let event = msg.get("event").and_then(Value::as_str);
        let action = match msg.get("type").and_then(Value::as_str) {
            Some("control") => msg.get("action").and_then(Value::as_str),
            _ => None,
        };

        match event.or(action) {
            Some("stop") => Some(ClientControl::Stop),
            _ => None,
        }
    }
}

/// Join committed fragments into the transcript sent with `{"final": ...}`.
pub fn aggregate_transcript(fragments: &[String]) -> String {
    fragments.join("\n").trim().to_string()
}
