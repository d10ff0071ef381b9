//! Outbound side of one connection.
//!
//! Every task that talks to the remote side (handshake, keepalive, command
//! tasks) holds an [`Emitter`] clone. Frames are queued on a bounded channel
//! and written by the single task that owns the WebSocket sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::{OutboundEvent, Packet};

/// Cloneable handle for queueing outbound packets.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::Sender<Packet>,
    alive: Arc<AtomicBool>,
}

/// Receiving half, owned by the writer task.
pub struct Outbox {
    rx: mpsc::Receiver<Packet>,
    alive: Arc<AtomicBool>,
}

impl Emitter {
    pub fn channel(capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity);
        let alive = Arc::new(AtomicBool::new(true));
        (
            Self {
                tx,
                alive: Arc::clone(&alive),
            },
            Outbox { rx, alive },
        )
    }

    /// Whether the connection behind this handle can still carry frames.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub async fn send_packet(&self, packet: Packet) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::Disconnection("connection is closed".into()));
        }
        self.tx
            .send(packet)
            .await
            .map_err(|_| RelayError::Disconnection("writer has stopped".into()))
    }

    pub async fn emit(&self, event: OutboundEvent) -> Result<(), RelayError> {
        debug!(event = event.name(), "Emitting");
        self.send_packet(event.into_packet()?).await
    }
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Flag the connection dead; every `Emitter` sees it immediately.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
