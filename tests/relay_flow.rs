//! End-to-end relay tests against an in-process Socket.IO endpoint and an
//! axum downstream service.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use hydra_agent::config::{IdentityMode, ReadyEvent};
use hydra_agent::protocol::Packet;
use hydra_agent::{tunnel, AgentState, Config, ExitReason};

const STEP: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

/// Accepts agent connections and hands each one to the test.
struct FakeEndpoint {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    conns: mpsc::UnboundedReceiver<ServerWs>,
}

impl FakeEndpoint {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let (tx, conns) = mpsc::unbounded_channel();
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(ws).is_err() {
                    break;
                }
            }
        });
        Self {
            addr,
            accepts,
            conns,
        }
    }

    async fn next_conn(&mut self) -> ServerWs {
        timeout(STEP, self.conns.recv())
            .await
            .expect("agent did not connect")
            .expect("listener stopped")
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

async fn send(ws: &mut ServerWs, frame: &str) {
    ws.send(Message::Text(frame.into())).await.unwrap();
}

async fn send_event(ws: &mut ServerWs, name: &str, data: Value) {
    let frame = Packet::Event {
        name: name.to_string(),
        data,
    }
    .encode()
    .unwrap();
    send(ws, &frame).await;
}

/// Next application event from the agent, skipping keepalive traffic.
async fn recv_event(ws: &mut ServerWs) -> (String, Value) {
    loop {
        let msg = timeout(STEP, ws.next())
            .await
            .expect("no event from agent")
            .expect("agent closed the connection")
            .unwrap();
        let Message::Text(text) = msg else { continue };
        match Packet::decode(text.as_str()).unwrap() {
            Packet::Event { name, .. } if name == "ping" => {}
            Packet::Event { name, data } => return (name, data),
            _ => {}
        }
    }
}

/// Accept a connection and run the welcome/register exchange.
async fn accept_registered(endpoint: &mut FakeEndpoint) -> (ServerWs, Value) {
    let mut ws = endpoint.next_conn().await;
    send(&mut ws, r#"0{"sid":"e1","upgrades":[],"pingInterval":25000,"pingTimeout":60000}"#).await;
    send(&mut ws, "40").await;
    send_event(&mut ws, "welcome", json!("hello agent")).await;
    let (name, data) = recv_event(&mut ws).await;
    assert_eq!(name, "register");
    send_event(&mut ws, "registered", json!({"sid": "s1"})).await;
    (ws, data)
}

async fn downstream() -> SocketAddr {
    let app = Router::new()
        .route("/x", post(|body: String| async move {
            assert_eq!(body, r#"{"x":1}"#);
            r#"{"y":2}"#
        }))
        .route(
            "/items/1",
            get(|| async { ([(HeaderName::from_static("x-foo"), "bar")], "hello") }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(endpoint: SocketAddr, service: SocketAddr) -> Config {
    let mut config = Config::default();
    config.remote.host = endpoint.ip().to_string();
    config.remote.port = endpoint.port();
    config.forward.post_url = format!("http://{service}/x");
    config.forward.base_url = format!("http://{service}");
    config.forward.timeout_ms = 2_000;
    config.keepalive.ping_frequency_ms = 200;
    config.auth.token = "secret".into();
    config
}

#[tokio::test]
async fn registers_and_relays_predict() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let manager = tunnel::client::spawn(state.clone());

    let (mut ws, registration) = accept_registered(&mut endpoint).await;
    assert_eq!(registration["token"], "secret");
    assert!(!registration["id"].as_str().unwrap().is_empty());

    send_event(
        &mut ws,
        "predict",
        json!({"id": "abc", "timestamp": "t0", "data": {"x": 1}}),
    )
    .await;
    let (name, data) = recv_event(&mut ws).await;
    assert_eq!(name, "predicted");
    assert_eq!(data, json!({"id": "abc", "success": true, "data": r#"{"y":2}"#}));

    // exactly one response per command
    let extra = timeout(Duration::from_millis(500), recv_event(&mut ws)).await;
    assert!(extra.is_err());

    state.exit.trigger(ExitReason::Shutdown);
    timeout(STEP, manager).await.unwrap().unwrap();
}

#[tokio::test]
async fn relays_handle_with_headers_and_base64_body() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    send_event(
        &mut ws,
        "handle",
        json!({"id": "m1", "timestamp": 1, "method": "get", "path": "/items/1", "data": null}),
    )
    .await;

    let (name, data) = recv_event(&mut ws).await;
    assert_eq!(name, "response");
    assert_eq!(data["id"], "m1");
    assert_eq!(data["success"], true);
    assert_eq!(data["data"], BASE64.encode("hello"));
    assert_eq!(data["header"]["X-Foo"], json!(["bar"]));
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn malformed_command_with_id_gets_failure_reply() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    send_event(&mut ws, "handle", json!({"id": "m2", "path": "/items/1"})).await;

    let (name, data) = recv_event(&mut ws).await;
    assert_eq!(name, "response");
    assert_eq!(data, json!({"id": "m2", "success": false, "data": ""}));
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn unreachable_endpoint_keeps_retrying() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let service = downstream().await;
    let mut cfg = config(closed, service);
    cfg.keepalive.ping_frequency_ms = 50;
    let state = AgentState::new(cfg).unwrap();
    let manager = tunnel::client::spawn(state.clone());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let attempts = state.stats.snapshot().attempts;
    assert!(attempts >= 5, "only {attempts} attempts");
    // one attempt per delay, never a tight loop
    assert!(attempts <= 600 / 50 + 2, "{attempts} attempts in 600ms");
    assert!(!state.exit.is_triggered());
    assert!(!manager.is_finished());

    state.exit.trigger(ExitReason::Shutdown);
    timeout(STEP, manager).await.unwrap().unwrap();
}

#[tokio::test]
async fn reconnects_once_after_disconnect() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    ws.close(None).await.unwrap();
    drop(ws);
    let dropped_at = Instant::now();

    let (_ws, _) = accept_registered(&mut endpoint).await;
    assert!(dropped_at.elapsed() >= Duration::from_millis(150));
    assert_eq!(endpoint.accepts(), 2);

    // no second reconnect while the new connection is healthy
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(endpoint.accepts(), 2);
    assert!(state.stats.snapshot().connected);
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn error_packet_triggers_exit() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    send(&mut ws, r#"44"boom""#).await;

    let reason = timeout(STEP, state.exit.wait()).await.unwrap();
    assert_eq!(reason.exit_code(), 1);
    assert!(matches!(&reason, ExitReason::ProtocolError(msg) if msg.contains("boom")));
    timeout(STEP, manager).await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_registration_ack_reconnects() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let mut cfg = config(endpoint.addr, service);
    cfg.auth.handshake_timeout_ms = 300;
    let state = AgentState::new(cfg).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let mut ws = endpoint.next_conn().await;
    send(&mut ws, "40").await;
    send_event(&mut ws, "welcome", json!("hi")).await;
    let (name, _) = recv_event(&mut ws).await;
    assert_eq!(name, "register");

    // never acknowledge; the agent should give up and dial again
    let (_ws, _) = accept_registered(&mut endpoint).await;
    assert_eq!(endpoint.accepts(), 2);
    assert!(!state.exit.is_triggered());
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn connect_packet_starts_fixed_identity_handshake() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let mut cfg = config(endpoint.addr, service);
    cfg.auth.ready_event = ReadyEvent::Connect;
    cfg.auth.identity = IdentityMode::Fixed;
    cfg.auth.fixed_id = Some("edge-7".into());
    let state = AgentState::new(cfg).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let mut ws = endpoint.next_conn().await;
    send(&mut ws, "40").await;
    let (name, data) = recv_event(&mut ws).await;
    assert_eq!(name, "register");
    assert_eq!(data, json!({"id": "edge-7", "token": "secret"}));
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn concurrent_commands_each_get_one_reply() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    for i in 0..20 {
        send_event(&mut ws, "predict", json!({"id": format!("p{i}"), "data": {"x": 1}})).await;
    }

    let mut ids = HashSet::new();
    for _ in 0..20 {
        let (name, data) = recv_event(&mut ws).await;
        assert_eq!(name, "predicted");
        assert_eq!(data["success"], true);
        assert!(ids.insert(data["id"].as_str().unwrap().to_string()));
    }
    assert_eq!(ids.len(), 20);
    let extra = timeout(Duration::from_millis(500), recv_event(&mut ws)).await;
    assert!(extra.is_err());

    // counted once written, which may trail our read by a moment
    timeout(STEP, async {
        while state.stats.snapshot().responses_sent < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let stats = state.stats.snapshot();
    assert_eq!(stats.commands_received, 20);
    assert_eq!(stats.responses_sent, 20);
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn error_event_triggers_exit() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let state = AgentState::new(config(endpoint.addr, service)).unwrap();
    let manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    send_event(&mut ws, "error", json!("Not authorized")).await;

    let reason = timeout(STEP, state.exit.wait()).await.unwrap();
    assert_eq!(
        reason,
        ExitReason::ProtocolError("protocol error: Not authorized".into())
    );
    timeout(STEP, manager).await.unwrap().unwrap();
    assert_eq!(endpoint.accepts(), 1);
}

#[tokio::test]
async fn unreachable_downstream_replies_with_failure() {
    let mut endpoint = FakeEndpoint::start().await;
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let state = AgentState::new(config(endpoint.addr, closed)).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let (mut ws, _) = accept_registered(&mut endpoint).await;
    send_event(&mut ws, "predict", json!({"id": "abc", "data": {"x": 1}})).await;

    let (name, data) = recv_event(&mut ws).await;
    assert_eq!(name, "predicted");
    assert_eq!(data, json!({"id": "abc", "success": false, "data": ""}));
    assert!(!state.exit.is_triggered());
    state.exit.trigger(ExitReason::Shutdown);
}

#[tokio::test]
async fn numeric_session_id_acknowledges_registration() {
    let mut endpoint = FakeEndpoint::start().await;
    let service = downstream().await;
    let mut cfg = config(endpoint.addr, service);
    cfg.auth.handshake_timeout_ms = 300;
    let state = AgentState::new(cfg).unwrap();
    let _manager = tunnel::client::spawn(state.clone());

    let mut ws = endpoint.next_conn().await;
    send_event(&mut ws, "welcome", json!("hi")).await;
    let (name, _) = recv_event(&mut ws).await;
    assert_eq!(name, "register");
    send_event(&mut ws, "registered", json!({"sid": 7})).await;

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(endpoint.accepts(), 1);
    assert!(state.stats.snapshot().connected);
    state.exit.trigger(ExitReason::Shutdown);
}
