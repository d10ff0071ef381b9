//! Registration handshake.
//!
//! On the ready trigger the agent emits `register {id, token}`. The server's
//! `registered {sid}` acknowledgment is only logged: commands are served
//! whether or not it ever arrives. What is tracked is the deadline; when it
//! passes without an acknowledgment the connection fails with
//! `HandshakeTimeout`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::config::{AuthConfig, IdentityMode};
use crate::protocol::{OutboundEvent, Registered, Registration};

/// Source of the `id` sent with `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// New UUID every time the handshake runs.
    PerAttempt,
    /// UUID fixed for the lifetime of the process.
    PerProcess(String),
    /// Operator-supplied identity.
    Fixed(String),
}

impl IdentityPolicy {
    pub fn from_config(auth: &AuthConfig) -> Self {
        match (auth.identity, auth.fixed_id.as_deref()) {
            (IdentityMode::Fixed, Some(id)) => Self::Fixed(id.to_string()),
            (IdentityMode::PerProcess, _) => Self::PerProcess(Uuid::new_v4().to_string()),
            // validation rejects `fixed` without an id; fall back to fresh ids
            (IdentityMode::Fixed | IdentityMode::PerAttempt, _) => Self::PerAttempt,
        }
    }

    pub fn identity(&self) -> String {
        match self {
            Self::PerAttempt => Uuid::new_v4().to_string(),
            Self::PerProcess(id) | Self::Fixed(id) => id.clone(),
        }
    }
}

/// Per-connection handshake state.
pub struct Handshake {
    token: String,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Handshake {
    pub fn new(token: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            token: token.into(),
            timeout,
            deadline: None,
        }
    }

    /// Build the `register` event and arm the acknowledgment deadline.
    pub fn on_ready(&mut self, policy: &IdentityPolicy) -> OutboundEvent {
        let id = policy.identity();
        info!(%id, "Authenticating");
        self.deadline = self.timeout.map(|t| Instant::now() + t);
        OutboundEvent::Register(Registration {
            id,
            token: self.token.clone(),
        })
    }

    pub fn on_registered(&mut self, ack: &Registered) {
        self.deadline = None;
        info!(sid = %ack.sid(), "Authenticated");
    }

    /// Pending acknowledgment deadline, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_default()
    }
}

/// Resolves at `deadline`, or never when there is none.
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
