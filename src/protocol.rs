//! Wire protocol: Socket.IO v2 packets over an Engine.IO 3 WebSocket.
//!
//! Every WebSocket text frame is one Engine.IO packet. Type `4` carries a
//! Socket.IO packet whose own type follows immediately:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":60000}   open
//! 1                                                        close
//! 2 / 3                                                    ping / pong
//! 40                                                       namespace connect
//! 41                                                       namespace disconnect
//! 42["predict",{"id":"abc","data":{...}}]                  event
//! 44"unauthorized"                                         error
//! 6                                                        noop
//! ```
//!
//! Inbound events are validated into [`InboundEvent`] here, at the boundary;
//! the rest of the crate never touches raw `Value` field access.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::RelayError;

/// Engine.IO open handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Connect,
    Disconnect,
    Event { name: String, data: Value },
    Error(Value),
    Noop,
}

impl Packet {
    /// Build an event packet from any serializable payload.
    pub fn event(name: &str, data: impl Serialize) -> Result<Self, RelayError> {
        Ok(Self::Event {
            name: name.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn decode(frame: &str) -> Result<Self, RelayError> {
        let mut chars = frame.chars();
        let Some(kind) = chars.next() else {
            return Err(RelayError::malformed("frame", "empty frame"));
        };
        let body = chars.as_str();
        match kind {
            '0' => serde_json::from_str(body)
                .map(Self::Open)
                .map_err(|e| RelayError::malformed("open", e.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(body.to_string())),
            '3' => Ok(Self::Pong(body.to_string())),
            '4' => decode_message(body),
            '6' => Ok(Self::Noop),
            other => Err(RelayError::malformed(
                "frame",
                format!("unknown engine packet type `{other}`"),
            )),
        }
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(match self {
            Self::Open(hs) => format!("0{}", serde_json::to_string(hs)?),
            Self::Close => "1".to_string(),
            Self::Ping(probe) => format!("2{probe}"),
            Self::Pong(probe) => format!("3{probe}"),
            Self::Connect => "40".to_string(),
            Self::Disconnect => "41".to_string(),
            Self::Event { name, data } => format!("42{}", serde_json::to_string(&json!([name, data]))?),
            Self::Error(data) => format!("44{}", serde_json::to_string(data)?),
            Self::Noop => "6".to_string(),
        })
    }
}

/// Decode the Socket.IO layer (everything after the engine `4`).
fn decode_message(body: &str) -> Result<Packet, RelayError> {
    let mut chars = body.chars();
    let Some(kind) = chars.next() else {
        return Err(RelayError::malformed("message", "missing socket.io packet type"));
    };
    let rest = strip_namespace(chars.as_str());
    match kind {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            // optional ack id precedes the JSON array
            let json = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let items: Vec<Value> = serde_json::from_str(json)
                .map_err(|e| RelayError::malformed("event", e.to_string()))?;
            let mut items = items.into_iter();
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(RelayError::malformed("event", "event name must be a string")),
            };
            Ok(Packet::Event {
                name,
                data: items.next().unwrap_or(Value::Null),
            })
        }
        '4' => {
            let data = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()))
            };
            Ok(Packet::Error(data))
        }
        other => Err(RelayError::malformed(
            "message",
            format!("unsupported socket.io packet type `{other}`"),
        )),
    }
}

/// Drop a leading `/namespace,` if present.
fn strip_namespace(s: &str) -> &str {
    if s.starts_with('/') {
        s.split_once(',').map_or("", |(_, rest)| rest)
    } else {
        s
    }
}

// ─── Inbound events ─────────────────────────────────────────────────────────

/// Which of the two command flavours an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `predict`: payload POSTed to a single fixed URL.
    Predict,
    /// `handle`: method and path chosen by the sender.
    Handle,
}

impl CommandKind {
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "predict" => Some(Self::Predict),
            "handle" => Some(Self::Handle),
            _ => None,
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            Self::Predict => "predict",
            Self::Handle => "handle",
        }
    }

    /// Name of the outbound event that answers this kind.
    pub fn reply_event(self) -> &'static str {
        match self {
            Self::Predict => "predicted",
            Self::Handle => "response",
        }
    }

    /// Whether `packet` is a reply to some command.
    pub fn is_reply(packet: &Packet) -> bool {
        matches!(packet, Packet::Event { name, .. }
            if name == Self::Predict.reply_event() || name == Self::Handle.reply_event())
    }
}

/// `predict {id, timestamp, data}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictCommand {
    #[serde(deserialize_with = "correlation_id")]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

/// `handle {id, timestamp, method, path, data}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandleCommand {
    #[serde(deserialize_with = "correlation_id")]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Predict(PredictCommand),
    Handle(HandleCommand),
}

impl Command {
    pub fn id(&self) -> &str {
        match self {
            Self::Predict(c) => &c.id,
            Self::Handle(c) => &c.id,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Predict(_) => CommandKind::Predict,
            Self::Handle(_) => CommandKind::Handle,
        }
    }

    /// Sender-side timestamp, for log lines only.
    pub fn timestamp(&self) -> Loose<'_> {
        let ts = match self {
            Self::Predict(c) => c.timestamp.as_ref(),
            Self::Handle(c) => c.timestamp.as_ref(),
        };
        Loose(ts)
    }
}

/// Display adapter for an optional, free-form field (timestamps, session ids).
pub struct Loose<'a>(Option<&'a Value>);

impl fmt::Display for Loose<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(Value::String(s)) => f.write_str(s),
            Some(v) => write!(f, "{v}"),
            None => f.write_str("-"),
        }
    }
}

/// `registered {sid}`. Any payload acknowledges; `sid` is whatever the
/// server put there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub sid: Option<Value>,
}

impl Registered {
    pub fn from_payload(data: &Value) -> Self {
        Self {
            sid: data.get("sid").filter(|v| !v.is_null()).cloned(),
        }
    }

    pub fn sid(&self) -> Loose<'_> {
        Loose(self.sid.as_ref())
    }
}

/// An inbound named event after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Welcome(Value),
    Registered(Registered),
    Command(Command),
    Error(Value),
    Other(String),
}

impl InboundEvent {
    pub fn from_event(name: &str, data: Value) -> Result<Self, RelayError> {
        match name {
            "welcome" => Ok(Self::Welcome(data)),
            "registered" => Ok(Self::Registered(Registered::from_payload(&data))),
            "predict" => serde_json::from_value(data)
                .map(|c| Self::Command(Command::Predict(c)))
                .map_err(|e| RelayError::malformed(name, e.to_string())),
            "handle" => serde_json::from_value(data)
                .map(|c| Self::Command(Command::Handle(c)))
                .map_err(|e| RelayError::malformed(name, e.to_string())),
            "error" => Ok(Self::Error(data)),
            other => Ok(Self::Other(other.to_string())),
        }
    }
}

/// Best-effort correlation id from an event that failed validation.
pub fn correlation_id_of(data: &Value) -> Option<String> {
    id_from_value(data.get("id")?.clone())
}

fn id_from_value(v: Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn correlation_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    let shown = v.to_string();
    id_from_value(v)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid correlation id {shown}")))
}

// ─── Outbound events ────────────────────────────────────────────────────────

/// `register {id, token}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub id: String,
    pub token: String,
}

/// Header name → every value the downstream sent for it.
pub type HeaderCollection = BTreeMap<String, Vec<String>>;

/// The single answer to one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub id: String,
    pub success: bool,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderCollection>,
}

impl CommandResponse {
    pub fn failure(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: String::new(),
            header: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Register(Registration),
    Ping,
    Reply(CommandKind, CommandResponse),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Ping => "ping",
            Self::Reply(kind, _) => kind.reply_event(),
        }
    }

    pub fn into_packet(self) -> Result<Packet, RelayError> {
        let name = self.name();
        match self {
            Self::Register(reg) => Packet::event(name, reg),
            Self::Ping => Packet::event(name, ""),
            Self::Reply(_, resp) => Packet::event(name, resp),
        }
    }
}
