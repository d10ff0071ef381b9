//! Shared agent state, built once in `main` and cloned into every task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::RequestBridge;
use crate::config::Config;
use crate::error::RelayError;
use crate::signal::ExitSignal;
use crate::tunnel::handshake::IdentityPolicy;

/// Everything a connection or command task needs. Cloning is cheap.
#[derive(Clone)]
pub struct AgentState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Process-wide termination signal.
    pub exit: ExitSignal,
    /// HTTP forwarder shared by all command tasks.
    pub bridge: Arc<RequestBridge>,
    /// How `register` picks its `id`.
    pub identity: Arc<IdentityPolicy>,
    /// Connection counters.
    pub stats: Arc<RelayStats>,
    /// Monotonic instant when the agent started (for uptime in logs).
    pub start_time: Instant,
}

impl AgentState {
    pub fn new(config: Config) -> Result<Self, RelayError> {
        let bridge = RequestBridge::new(&config.forward, config.http_timeout())?;
        let identity = IdentityPolicy::from_config(&config.auth);
        Ok(Self {
            config: Arc::new(config),
            exit: ExitSignal::new(),
            bridge: Arc::new(bridge),
            identity: Arc::new(identity),
            stats: Arc::new(RelayStats::default()),
            start_time: Instant::now(),
        })
    }
}

/// Lock-free connection counters, updated on the hot path.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub connected: AtomicBool,
    /// Dial attempts, successful or not.
    pub attempts: AtomicU64,
    /// Dials that produced a live connection.
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub commands_received: AtomicU64,
    /// Replies written to the socket; queued but unsent replies do not count.
    pub responses_sent: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connected: bool,
    pub attempts: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub commands_received: u64,
    pub responses_sent: u64,
}

impl RelayStats {
    pub(crate) fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
        }
    }
}
