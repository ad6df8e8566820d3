//! JSON control protocol carried over the side data channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Log payload sent once a reply generator is about to be built for a turn.
pub const PAUSE_DETECTED: &str = "pause_detected";
/// Log payload sent once per turn when the reply starts producing output.
pub const RESPONSE_STARTING: &str = "response_starting";

/// Messages sent from the server to the peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Informational event (e.g. `pause_detected`, `response_starting`).
    Log(String),
    /// A handler fault, reported to the peer without closing the session.
    Error(String),
    Warning(String),
    /// The handler is waiting for auxiliary inputs.
    SendInput(Vec<Value>),
    /// New side outputs are ready to be fetched.
    FetchOutput(Vec<Value>),
}

impl ServerMessage {
    pub fn log(data: impl Into<String>) -> Self {
        ServerMessage::Log(data.into())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A `chat` or `stop_chat` message forwarded to the handler's chat hook.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ChatMessage {
    pub fn is_stop(&self) -> bool {
        self.kind == "stop_chat"
    }
}

/// A decoded inbound data-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Chat(ChatMessage),
    StopChat(ChatMessage),
    /// Well-formed JSON of any other shape.
    Other(Value),
}

/// Decodes a raw data-channel message.
///
/// Fails only when `raw` is not valid JSON, or when a `chat`/`stop_chat`
/// message has fields of the wrong type.
pub fn parse_control_message(raw: &str) -> serde_json::Result<ControlMessage> {
    let value: Value = serde_json::from_str(raw)?;
    match value.get("type").and_then(Value::as_str) {
        Some("chat") => Ok(ControlMessage::Chat(serde_json::from_value(value)?)),
        Some("stop_chat") => Ok(ControlMessage::StopChat(serde_json::from_value(value)?)),
        _ => Ok(ControlMessage::Other(value)),
    }
}

/// Body returned when an offer is refused by admission control.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdmissionRejection {
    pub status: String,
    pub meta: RejectionMeta,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RejectionMeta {
    pub error: String,
    pub limit: usize,
}

impl AdmissionRejection {
    pub fn concurrency_limit_reached(limit: usize) -> Self {
        Self {
            status: "failed".to_string(),
            meta: RejectionMeta {
                error: "concurrency_limit_reached".to_string(),
                limit,
            },
        }
    }
}
