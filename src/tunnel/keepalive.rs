//! Keepalive loop, one per connection.
//!
//! Sleeps, checks liveness, pings. The first failed liveness check ends the
//! loop quietly; rebuilding the connection is the manager's job.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{OutboundEvent, Packet};
use crate::signal::ExitSignal;
use crate::tunnel::emitter::Emitter;

pub fn spawn(emitter: Emitter, frequency: Duration, exit: ExitSignal) -> JoinHandle<()> {
    tokio::spawn(keepalive_loop(emitter, frequency, exit))
}

async fn keepalive_loop(emitter: Emitter, frequency: Duration, exit: ExitSignal) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(frequency) => {}
            () = exit.cancelled() => return,
        }
        if !emitter.is_alive() {
            debug!("Keepalive: connection gone, stopping");
            return;
        }
        // engine heartbeat keeps the transport open; the event is for the app
        if emitter.send_packet(Packet::Ping(String::new())).await.is_err()
            || emitter.emit(OutboundEvent::Ping).await.is_err()
        {
            debug!("Keepalive: send failed, stopping");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ExitReason;

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval() {
        let (emitter, mut outbox) = Emitter::channel(16);
        let task = spawn(emitter, Duration::from_secs(10), ExitSignal::new());

        for _ in 0..3 {
            assert_eq!(outbox.recv().await, Some(Packet::Ping(String::new())));
            assert_eq!(
                outbox.recv().await,
                Some(OutboundEvent::Ping.into_packet().unwrap())
            );
        }
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_sent_before_first_interval() {
        let (emitter, mut outbox) = Emitter::channel(16);
        let _task = spawn(emitter, Duration::from_secs(10), ExitSignal::new());
        let early = tokio::time::timeout(Duration::from_secs(9), outbox.recv()).await;
        assert!(early.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_silently_when_connection_dies() {
        let (emitter, outbox) = Emitter::channel(16);
        let task = spawn(emitter, Duration::from_secs(10), ExitSignal::new());
        outbox.mark_dead();
        tokio::time::timeout(Duration::from_secs(11), task)
            .await
            .expect("loop should exit after one interval")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_exit_signal() {
        let (emitter, _outbox) = Emitter::channel(16);
        let exit = ExitSignal::new();
        let task = spawn(emitter, Duration::from_secs(10), exit.clone());
        exit.trigger(ExitReason::Shutdown);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should exit promptly")
            .unwrap();
    }
}
