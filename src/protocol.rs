//! Wire contract between the store client and the sync backend.
//!
//! Every frame is a JSON object with a `type` discriminator.
//!
//! Client → Server: `client:hello`, `client:publish`, `client:request:snapshot`.
//!
//! Server → Client: `server:hello`, `server:log`, `server:snapshot`,
//! `server:event`, `server:ack`, `server:directive`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::identity::{Record, RecordRef};

pub const SERVER_HELLO: &str = "server:hello";
pub const SERVER_LOG: &str = "server:log";
pub const SERVER_SNAPSHOT: &str = "server:snapshot";
pub const SERVER_EVENT: &str = "server:event";
pub const SERVER_ACK: &str = "server:ack";
pub const SERVER_DIRECTIVE: &str = "server:directive";

/// Errors decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not an object with a string `type`")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Actions
// ============================================================================

/// Mutation action carried in `action`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Insert,
    Merge,
    Save,
    Delete,
    Update,
    /// Action outside the known vocabulary, kept verbatim.
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Insert => "module:insert",
            Action::Merge => "module:merge",
            Action::Save => "module:save",
            Action::Delete => "module:delete",
            Action::Update => "module:update",
            Action::Other(raw) => raw,
        }
    }

    /// Delete actions remove the resolved row.
    pub fn is_delete(&self) -> bool {
        match self {
            Action::Delete => true,
            Action::Other(raw) => matches!(raw.as_str(), "module:remove" | "remove"),
            _ => false,
        }
    }

    /// Merge actions shallow-merge the payload onto the resolved row; every
    /// other non-delete action replaces it.
    pub fn is_merge(&self) -> bool {
        matches!(self, Action::Merge | Action::Update)
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.strip_prefix("module:").unwrap_or(&raw) {
            "insert" => Action::Insert,
            "merge" => Action::Merge,
            "save" => Action::Save,
            "delete" => Action::Delete,
            "update" => Action::Update,
            _ => Action::Other(raw),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Client → Server
// ============================================================================

/// Outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "client:hello")]
    Hello(ClientHello),
    #[serde(rename = "client:publish")]
    Publish(PublishRequest),
    #[serde(rename = "client:request:snapshot")]
    RequestSnapshot(SnapshotRequest),
}

impl ClientMessage {
    /// Encode as a text frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Correlation id of the frame.
    pub fn request_id(&self) -> &str {
        match self {
            ClientMessage::Hello(hello) => &hello.request_id,
            ClientMessage::Publish(publish) => &publish.request_id,
            ClientMessage::RequestSnapshot(request) => &request.request_id,
        }
    }
}

/// Handshake sent as soon as the transport opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub branch_id: String,
    pub role: String,
    pub history_limit: u32,
    pub request_snapshot: bool,
    pub request_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    pub request_id: String,
}

/// Mutation frame. `request_id` appears both here and in `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub branch_id: String,
    pub module_id: String,
    pub table: String,
    pub action: Action,
    pub record: Value,
    pub meta: Map<String, Value>,
    pub include_record: bool,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub branch_id: String,
    pub module_id: String,
    pub request_id: String,
}

// ============================================================================
// Server → Client
// ============================================================================

/// Decoded inbound frames.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Hello(Value),
    Log(LogMessage),
    Snapshot(SnapshotEnvelope),
    Event(EventEnvelope),
    Ack(AckEnvelope),
    /// Opaque, forwarded verbatim.
    Directive(Value),
}

impl ServerMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let frame: Value = serde_json::from_str(text)?;
        Self::from_value(frame)
    }

    /// Decode an already-parsed frame.
    pub fn from_value(frame: Value) -> Result<Self, DecodeError> {
        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();

        match kind.as_str() {
            SERVER_HELLO => Ok(ServerMessage::Hello(frame)),
            SERVER_DIRECTIVE => Ok(ServerMessage::Directive(frame)),
            SERVER_LOG => payload("log", frame).map(ServerMessage::Log),
            SERVER_SNAPSHOT => payload("snapshot", frame).map(ServerMessage::Snapshot),
            SERVER_EVENT => payload("event", frame).map(ServerMessage::Event),
            SERVER_ACK => Ok(ServerMessage::Ack(AckEnvelope::from_frame(frame))),
            _ => Err(DecodeError::UnknownType(kind)),
        }
    }

    /// The `type` tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello(_) => SERVER_HELLO,
            ServerMessage::Log(_) => SERVER_LOG,
            ServerMessage::Snapshot(_) => SERVER_SNAPSHOT,
            ServerMessage::Event(_) => SERVER_EVENT,
            ServerMessage::Ack(_) => SERVER_ACK,
            ServerMessage::Directive(_) => SERVER_DIRECTIVE,
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &'static str, frame: Value) -> Result<T, DecodeError> {
    serde_json::from_value(frame).map_err(|source| DecodeError::InvalidPayload { kind, source })
}

/// `server:log`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: Option<Value>,
}

/// `server:snapshot`: full replacement for the named modules.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Module id to ModuleState-shaped payload.
    #[serde(default)]
    pub modules: Map<String, Value>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Legacy event layout carrying the record under `entry.record`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct EventEntry {
    #[serde(default)]
    pub record: Option<Value>,
}

/// `server:event`: incremental change to one table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default)]
    pub module_id: Option<String>,
    pub table: String,
    pub action: Action,
    #[serde(default)]
    pub record_ref: Option<Value>,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub entry: Option<EventEntry>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub version: Option<i64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub sequence: Option<u64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub event_id: Option<String>,
}

impl EventEnvelope {
    /// Payload record: `record`, falling back to `entry.record`.
    pub fn payload(&self) -> Option<&Record> {
        self.record
            .as_ref()
            .and_then(Value::as_object)
            .or_else(|| {
                self.entry
                    .as_ref()
                    .and_then(|entry| entry.record.as_ref())
                    .and_then(Value::as_object)
            })
    }

    /// Identity of the affected row: `recordRef`, falling back to a bare
    /// `id`/`key` on the payload.
    pub fn identity(&self) -> Option<RecordRef> {
        self.record_ref
            .as_ref()
            .and_then(RecordRef::from_value)
            .or_else(|| self.payload().and_then(RecordRef::from_record))
    }
}

/// `server:ack`, kept whole as the payload handed to the waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AckEnvelope {
    /// Echoed correlation id (`meta.clientMeta.requestId`, then
    /// `meta.requestId`, then top-level `requestId`).
    pub request_id: Option<String>,
    pub payload: Value,
}

impl AckEnvelope {
    pub fn from_frame(frame: Value) -> Self {
        let request_id = [
            &["meta", "clientMeta", "requestId"][..],
            &["meta", "requestId"][..],
            &["requestId"][..],
        ]
        .iter()
        .find_map(|path| {
            path.iter()
                .try_fold(&frame, |node, field| node.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Self {
            request_id,
            payload: frame,
        }
    }
}

/// Numeric value as an integer: JSON integers, integral floats and numeric
/// strings.
pub fn numeric_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(numeric_i64))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(numeric_i64)
        .and_then(|n| u64::try_from(n).ok()))
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
