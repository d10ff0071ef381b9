//! Process-wide termination signal.
//!
//! Any component may call [`ExitSignal::trigger`]; the first reason wins and
//! every later call returns immediately. All clones observe the same state, so
//! the connection loop, keepalive loops and `main` can all wait on it.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why the process is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The remote side reported an error; fatal by policy.
    ProtocolError(String),
    /// SIGINT / SIGTERM or an explicit shutdown request.
    Shutdown,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProtocolError(_) => 1,
            Self::Shutdown => 0,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Self::Shutdown => f.write_str("shutdown requested"),
        }
    }
}

/// First-writer-wins, never-blocking exit signal.
#[derive(Clone, Default)]
pub struct ExitSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ExitReason>>,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` and wake every waiter. Returns `true` only for the
    /// call that actually set the reason.
    pub fn trigger(&self, reason: ExitReason) -> bool {
        match self.reason.set(reason) {
            Ok(()) => {
                self.token.cancel();
                true
            }
            Err(ignored) => {
                debug!(%ignored, "Exit already signalled, ignoring");
                false
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The winning reason, if any.
    pub fn reason(&self) -> Option<&ExitReason> {
        self.reason.get()
    }

    /// Resolves once the signal has fired.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Wait for the signal and return the winning reason.
    pub async fn wait(&self) -> ExitReason {
        self.token.cancelled().await;
        // `reason` is always set before `cancel()` runs.
        self.reason.get().cloned().unwrap_or(ExitReason::Shutdown)
    }
}
