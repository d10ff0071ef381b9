//! Outbound connection to the command endpoint.
//!
//! - `client`: connection manager: dial, dispatch inbound frames, single
//!   owning reconnect loop.
//! - `handshake`: `register` on ready, ack logging, handshake timeout.
//! - `keepalive`: periodic ping while the connection is alive.
//! - `emitter`: cloneable outbound handle shared by all per-connection tasks.

pub mod client;
pub mod emitter;
pub mod handshake;
pub mod keepalive;
