//! Error taxonomy for the relay.
//!
//! None of these ever reach an external caller. Each variant maps to one
//! handling policy in the connection manager or the bridge:
//!
//! | Variant                  | Handling                                   |
//! |--------------------------|--------------------------------------------|
//! | `ConnectFailure`         | retried forever at the fixed interval      |
//! | `ProtocolError`          | fatal, triggers the exit signal            |
//! | `Disconnection`          | one fresh connection attempt               |
//! | `DownstreamCallFailure`  | reported upstream as `success: false`      |
//! | `SerializationFailure`   | logged, reported as `success: false`       |
//! | `MalformedEvent`         | logged, `success: false` when id readable  |
//! | `HandshakeTimeout`       | connection torn down and re-dialled        |

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("disconnected: {0}")]
    Disconnection(String),

    #[error("downstream call failed: {0}")]
    DownstreamCallFailure(#[from] reqwest::Error),

    #[error("payload serialization failed: {0}")]
    SerializationFailure(#[from] serde_json::Error),

    #[error("malformed `{event}` event: {reason}")]
    MalformedEvent { event: String, reason: String },

    #[error("no registration acknowledgment within {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),
}

impl RelayError {
    pub(crate) fn malformed(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event: event.into(),
            reason: reason.into(),
        }
    }

    /// Short, stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectFailure(_) => "connect_failure",
            Self::ProtocolError(_) => "protocol_error",
            Self::Disconnection(_) => "disconnection",
            Self::DownstreamCallFailure(_) => "downstream_call_failure",
            Self::SerializationFailure(_) => "serialization_failure",
            Self::MalformedEvent { .. } => "malformed_event",
            Self::HandshakeTimeout(_) => "handshake_timeout",
        }
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolError(_))
    }
}

/// Problems found while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
