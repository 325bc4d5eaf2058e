//! Channel wire protocol.
//!
//! Every text frame is a JSON array of five elements:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//!     │       │     │      │       └── event-specific object
//!     │       │     │      └── "phx_join" | "event" | "live_patch" | ...
//!     │       │     └── "lv:<id>" | "lvu:<n>" | "phoenix"
//!     │       └── per-message reference echoed in the reply (null on pushes)
//!     └── reference of the join that opened the topic
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use tessera_core::Parts;

use crate::upload::UploadEntryMeta;

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const UPLOAD_TOPIC_PREFIX: &str = "lvu:";

/// Message kinds, keyed by the event string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Join,
    Leave,
    Heartbeat,
    Event,
    LivePatch,
    AllowUpload,
    Progress,
    Chunk,
    Reply,
    Diff,
    Other(String),
}

impl MessageKind {
    pub fn parse(event: &str) -> Self {
        match event {
            "phx_join" => Self::Join,
            "phx_leave" => Self::Leave,
            "heartbeat" => Self::Heartbeat,
            "event" => Self::Event,
            "live_patch" => Self::LivePatch,
            "allow_upload" => Self::AllowUpload,
            "progress" => Self::Progress,
            "chunk" => Self::Chunk,
            "phx_reply" => Self::Reply,
            "diff" => Self::Diff,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One framed message, inbound or outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Unsolicited server message.
    pub fn push(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self::new(None, None, topic, event, payload)
    }

    /// Reply to `request`, echoing its references.
    pub fn reply(request: &Envelope, status: &str, response: Value) -> Self {
        Self::new(
            request.join_ref.clone(),
            request.msg_ref.clone(),
            request.topic.clone(),
            "phx_reply",
            json!({ "status": status, "response": response }),
        )
    }

    pub fn ok(request: &Envelope, response: Value) -> Self {
        Self::reply(request, "ok", response)
    }

    /// Reply to a join with the full rendered tree.
    pub fn rendered(request: &Envelope, parts: &Parts) -> Result<Self, ProtocolError> {
        Ok(Self::ok(request, json!({ "rendered": to_value(parts)? })))
    }

    /// Reply carrying a diff.
    pub fn diff_reply(request: &Envelope, parts: &Parts) -> Result<Self, ProtocolError> {
        Ok(Self::ok(request, json!({ "diff": to_value(parts)? })))
    }

    /// Unsolicited diff push.
    pub fn diff_push(topic: &str, parts: &Parts) -> Result<Self, ProtocolError> {
        Ok(Self::push(topic, "diff", to_value(parts)?))
    }

    pub fn live_patch(topic: &str, to: &str) -> Self {
        Self::push(topic, "live_patch", json!({ "kind": "push", "to": to }))
    }

    pub fn live_redirect(topic: &str, to: &str) -> Self {
        Self::push(topic, "live_redirect", json!({ "kind": "push", "to": to }))
    }

    pub fn redirect(topic: &str, to: &str) -> Self {
        Self::push(topic, "redirect", json!({ "to": to }))
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.event)
    }

    /// Decode the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::InvalidPayload(format!("{}: {e}", self.event)))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.join_ref, &self.msg_ref, &self.topic, &self.event, &self.payload).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (join_ref, msg_ref, topic, event, payload) =
            <(Option<String>, Option<String>, String, String, Value)>::deserialize(deserializer)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

fn to_value(parts: &Parts) -> Result<Value, ProtocolError> {
    serde_json::to_value(parts).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

// ── Payloads ─────────────────────────────────────────────────

/// Payload of `phx_join` on a view topic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinPayload {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub redirect: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub session: String,
    #[serde(default, rename = "static")]
    pub static_token: Option<String>,
}

impl JoinPayload {
    /// Location the client is joining; `redirect` wins over `url`.
    pub fn location(&self) -> Option<&str> {
        self.redirect.as_deref().or(self.url.as_deref())
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.params.get("_csrf_token").and_then(Value::as_str)
    }
}

/// Payload of `event`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub event: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub cid: Option<tessera_core::Cid>,
}

/// Payload of `live_patch`.
#[derive(Debug, Clone, Deserialize)]
pub struct LivePatchPayload {
    pub url: String,
}

/// Payload of `allow_upload`.
#[derive(Debug, Clone, Deserialize)]
pub struct AllowUploadPayload {
    #[serde(rename = "ref")]
    pub upload_ref: String,
    #[serde(default)]
    pub entries: Vec<UploadEntryMeta>,
}

/// Payload of `progress`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressPayload {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(rename = "ref")]
    pub upload_ref: String,
    pub entry_ref: String,
    pub progress: u8,
}

/// Payload of `phx_join` on an upload topic.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadJoinPayload {
    pub token: String,
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidPayload(String),
    InvalidFrame(String),
    FrameTooLarge(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::InvalidFrame(e) => write!(f, "Invalid binary frame: {e}"),
            Self::FrameTooLarge(n) => write!(f, "Frame of {n} bytes exceeds limit"),
        }
    }
}

impl std::error::Error for ProtocolError {}
