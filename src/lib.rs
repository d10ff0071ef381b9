#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! hydra-agent library: the pieces behind the `hydra-agent` binary.
//!
//! - `tunnel`: connection manager, handshake, keepalive
//! - `bridge`: forwards commands to the downstream HTTP service
//! - `protocol`: Socket.IO / Engine.IO codec and typed events
//! - `config`: TOML + env-var configuration
//! - `signal`: process-wide exit signal
//! - `state`: shared agent context and counters
//! - `error`: error taxonomy

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod signal;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use bridge::RequestBridge;
pub use config::Config;
pub use error::{ConfigError, RelayError};
pub use signal::{ExitReason, ExitSignal};
pub use state::AgentState;
