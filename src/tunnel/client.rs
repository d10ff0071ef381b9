//! Connection manager: outbound Socket.IO connection to the command endpoint.
//!
//! Spawned once on startup. Owns a single retry loop: dial, run the
//! connection until it ends, wait `ping_frequency`, dial again. The delay is
//! fixed and attempts are unbounded. Only a protocol error (or the exit
//! signal) ends the loop.
//!
//! Each live connection has one reader (this module), one writer task that
//! owns the WebSocket sink, one keepalive task, and one task per inbound
//! command. All reactions are in place before the first frame is read.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ReadyEvent;
use crate::error::RelayError;
use crate::protocol::{
    correlation_id_of, Command, CommandKind, CommandResponse, InboundEvent, OutboundEvent, Packet,
};
use crate::signal::ExitReason;
use crate::state::{AgentState, RelayStats};
use crate::tunnel::emitter::{Emitter, Outbox};
use crate::tunnel::handshake::{self, Handshake};
use crate::tunnel::keepalive;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Outbound frames queued per connection before senders wait.
const OUTBOUND_CAPACITY: usize = 256;

/// Spawn the connection manager. Returns a `JoinHandle` that finishes when
/// the exit signal fires or a protocol error occurs.
pub fn spawn(state: AgentState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state))
}

/// Main loop: connect, serve, wait, reconnect.
pub async fn run(state: AgentState) {
    let url = state.config.remote.ws_url();
    let delay = state.config.ping_frequency();

    loop {
        if state.exit.is_triggered() {
            break;
        }
        let attempt = RelayStats::incr(&state.stats.attempts);
        info!(attempt, "Connecting to {url}");

        match connect_and_run(&state, &url).await {
            Ok(()) => break,
            Err(e) if e.is_fatal() => {
                error!(kind = e.kind(), "{e}");
                state.exit.trigger(ExitReason::ProtocolError(e.to_string()));
                break;
            }
            Err(e @ RelayError::Disconnection(_)) => {
                RelayStats::incr(&state.stats.disconnects);
                info!("Disconnected: {e}, reconnecting in {}ms", delay.as_millis());
            }
            Err(e) => {
                warn!(
                    kind = e.kind(),
                    attempt,
                    "{e}, retrying in {}ms",
                    delay.as_millis()
                );
            }
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = state.exit.cancelled() => break,
        }
    }
    info!("Connection manager stopped");
}

/// Dial `url` and use native-tls without certificate checks when `secure`.
async fn dial(url: &str, secure: bool) -> Result<WsStream, RelayError> {
    let connector = if secure {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| RelayError::ConnectFailure(format!("TLS setup: {e}")))?;
        Connector::NativeTls(tls)
    } else {
        Connector::Plain
    };
    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
            .await
            .map_err(|e| RelayError::ConnectFailure(e.to_string()))?;
    Ok(ws)
}

/// One connection: dial, attach reactions, read until it ends.
///
/// `Ok(())` means the exit signal fired; every other ending is an error the
/// retry loop classifies.
async fn connect_and_run(state: &AgentState, url: &str) -> Result<(), RelayError> {
    let ws = dial(url, state.config.remote.secure).await?;
    let (ws_sink, mut ws_stream) = ws.split();

    RelayStats::incr(&state.stats.connects);
    state.stats.set_connected(true);
    info!("Transport connected");

    let (emitter, outbox) = Emitter::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(writer_task(ws_sink, outbox, Arc::clone(&state.stats)));
    // exits by itself on the first failed liveness check
    let _keepalive = keepalive::spawn(
        emitter.clone(),
        state.config.ping_frequency(),
        state.exit.clone(),
    );
    let mut handshake = Handshake::new(
        state.config.auth.token.clone(),
        state.config.handshake_timeout(),
    );

    let result = loop {
        let deadline = handshake.deadline();
        tokio::select! {
            msg = ws_stream.next() => {
                let Some(msg) = msg else {
                    break Err(RelayError::Disconnection("connection closed by remote".into()));
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => break Err(RelayError::Disconnection(e.to_string())),
                };
                match msg {
                    Message::Text(text) => {
                        if let Err(e) = on_frame(state, &emitter, &mut handshake, text.as_str()).await {
                            break Err(e);
                        }
                    }
                    Message::Close(frame) => {
                        let reason = frame.map_or_else(
                            || "close frame".to_string(),
                            |f| format!("close frame ({}): {}", u16::from(f.code), f.reason.as_str()),
                        );
                        break Err(RelayError::Disconnection(reason));
                    }
                    _ => {}
                }
            }
            () = handshake::expired(deadline) => {
                break Err(RelayError::HandshakeTimeout(handshake.timeout()));
            }
            () = state.exit.cancelled() => break Ok(()),
        }
    };

    emitter.mark_dead();
    writer.abort();
    state.stats.set_connected(false);
    result
}

/// Owns the sink; stops on the first failed write. Replies are counted
/// here, once they are actually on the wire.
async fn writer_task(mut sink: WsSink, mut outbox: Outbox, stats: Arc<RelayStats>) {
    while let Some(packet) = outbox.recv().await {
        let text = match packet.encode() {
            Ok(t) => t,
            Err(e) => {
                warn!(kind = e.kind(), "Dropping outbound packet: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!("Send failed: {e}");
            break;
        }
        if CommandKind::is_reply(&packet) {
            RelayStats::incr(&stats.responses_sent);
        }
    }
    outbox.mark_dead();
}

/// React to one inbound text frame. An `Err` ends the connection.
async fn on_frame(
    state: &AgentState,
    emitter: &Emitter,
    handshake: &mut Handshake,
    text: &str,
) -> Result<(), RelayError> {
    let packet = match Packet::decode(text) {
        Ok(p) => p,
        Err(e) => {
            warn!(kind = e.kind(), "Ignoring frame: {e}");
            return Ok(());
        }
    };

    match packet {
        Packet::Open(open) => {
            debug!(sid = %open.sid, ping_interval = open.ping_interval, "Engine session opened");
            Ok(())
        }
        Packet::Ping(probe) => emitter.send_packet(Packet::Pong(probe)).await,
        Packet::Pong(_) | Packet::Noop => Ok(()),
        Packet::Connect => {
            info!("Connected");
            if state.config.auth.ready_event == ReadyEvent::Connect {
                emitter.emit(handshake.on_ready(&state.identity)).await?;
            }
            Ok(())
        }
        Packet::Disconnect => Err(RelayError::Disconnection("server disconnected the socket".into())),
        Packet::Close => Err(RelayError::Disconnection("server closed the engine session".into())),
        Packet::Error(data) => Err(RelayError::ProtocolError(describe(&data))),
        Packet::Event { name, data } => on_event(state, emitter, handshake, &name, data).await,
    }
}

async fn on_event(
    state: &AgentState,
    emitter: &Emitter,
    handshake: &mut Handshake,
    name: &str,
    data: Value,
) -> Result<(), RelayError> {
    let command_kind = CommandKind::from_event_name(name);
    let fallback_id = command_kind.and_then(|_| correlation_id_of(&data));

    match InboundEvent::from_event(name, data) {
        Ok(InboundEvent::Welcome(msg)) => {
            info!(%msg, "Welcome message");
            if state.config.auth.ready_event == ReadyEvent::Welcome {
                emitter.emit(handshake.on_ready(&state.identity)).await?;
            }
        }
        Ok(InboundEvent::Registered(ack)) => handshake.on_registered(&ack),
        Ok(InboundEvent::Command(command)) => dispatch_command(state, emitter, command),
        Ok(InboundEvent::Error(data)) => return Err(RelayError::ProtocolError(describe(&data))),
        Ok(InboundEvent::Other(name)) => debug!(event = %name, "Ignoring unhandled event"),
        Err(e) => {
            warn!(kind = e.kind(), id = fallback_id.as_deref().unwrap_or("-"), "{e}");
            // still owe exactly one response when the id is readable
            if let (Some(kind), Some(id)) = (command_kind, fallback_id) {
                RelayStats::incr(&state.stats.commands_received);
                let emitter = emitter.clone();
                tokio::spawn(async move {
                    send_reply(&emitter, kind, CommandResponse::failure(id)).await;
                });
            }
        }
    }
    Ok(())
}

/// Run `command` on its own task; never waits for the downstream call.
fn dispatch_command(state: &AgentState, emitter: &Emitter, command: Command) {
    RelayStats::incr(&state.stats.commands_received);
    info!(
        id = command.id(),
        timestamp = %command.timestamp(),
        kind = command.kind().event_name(),
        "<== command"
    );

    let bridge = Arc::clone(&state.bridge);
    let emitter = emitter.clone();
    tokio::spawn(async move {
        let response = bridge.forward(&command).await;
        send_reply(&emitter, command.kind(), response).await;
    });
}

async fn send_reply(emitter: &Emitter, kind: CommandKind, response: CommandResponse) {
    let id = response.id.clone();
    if let Err(e) = emitter.emit(OutboundEvent::Reply(kind, response)).await {
        warn!(%id, kind = e.kind(), "Response not delivered: {e}");
    }
}

/// Error payloads are usually a bare string; avoid quoting those.
fn describe(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Null => "unspecified error".to_string(),
        other => other.to_string(),
    }
}
