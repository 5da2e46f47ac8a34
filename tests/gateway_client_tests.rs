use base64::{engine::general_purpose, Engine};
use clawlink::core::kernel::verify_ed25519;
use clawlink::gateway::identity::fingerprint;
use clawlink::gateway::AuthPayload;
use clawlink::{
    ClientEvent, ConnectionState, GatewayClient, GatewayConfig, GatewayError, NotificationKind,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(10);

/// Plays the gateway side of the protocol over a real socket
struct FakeGateway {
    listener: TcpListener,
    url: String,
}

impl FakeGateway {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    async fn accept(&self) -> ServerWs {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        accept_async(stream).await.unwrap()
    }
}

async fn send(ws: &mut ServerWs, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn send_event(ws: &mut ServerWs, event: &str, payload: Value) {
    send(ws, json!({"type": "event", "event": event, "payload": payload})).await;
}

async fn respond(ws: &mut ServerWs, id: &Value, payload: Value) {
    send(ws, json!({"type": "res", "id": id, "ok": true, "payload": payload})).await;
}

/// Next request frame from the client, skipping control frames
async fn recv_request(ws: &mut ServerWs) -> Value {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("no request from client")
            .expect("client closed the stream")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(frame["type"], "req");
            return frame;
        }
    }
}

/// Challenge, verify the signed connect request, and accept it
async fn handshake(ws: &mut ServerWs, nonce: &str) -> Value {
    send_event(ws, "connect.challenge", json!({"nonce": nonce, "ts": 1_700_000_000_000u64})).await;
    let connect = recv_request(ws).await;
    assert_eq!(connect["method"], "connect");

    let params = &connect["params"];
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    let device = &params["device"];
    assert_eq!(device["nonce"], nonce);

    let public_key = device["publicKey"].as_str().unwrap();
    let raw_key = general_purpose::STANDARD.decode(public_key).unwrap();
    assert_eq!(device["id"], fingerprint(&raw_key));

    let payload = AuthPayload {
        device_id: device["id"].as_str().unwrap().to_string(),
        client_id: params["client"]["id"].as_str().unwrap().to_string(),
        client_mode: params["client"]["mode"].as_str().unwrap().to_string(),
        role: params["role"].as_str().unwrap().to_string(),
        scopes: params["scopes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s.as_str().unwrap().to_string())
            .collect(),
        signed_at: device["signedAt"].as_i64().unwrap(),
        token: params["auth"]["token"].as_str().unwrap_or("").to_string(),
        nonce: nonce.to_string(),
    };
    verify_ed25519(
        public_key,
        payload.to_signing_string().as_bytes(),
        device["signature"].as_str().unwrap(),
    )
    .expect("connect signature must verify");

    respond(
        ws,
        &connect["id"],
        json!({"type": "hello-ok", "snapshot": {"uptimeMs": 1234, "presence": [], "health": {"ok": true}}}),
    )
    .await;
    connect
}

/// Answer sessions.list and chat.history
async fn serve_setup(ws: &mut ServerWs) {
    let sessions = recv_request(ws).await;
    assert_eq!(sessions["method"], "sessions.list");
    respond(
        ws,
        &sessions["id"],
        json!({"sessions": [
            {"key": "agent:heartbeat", "kind": "direct", "displayName": "heartbeat"},
            {"key": "main", "kind": "direct", "displayName": "Main", "sessionId": "s-1", "model": "test-model"},
            {"key": "group", "kind": "group", "displayName": "Group"}
        ]}),
    )
    .await;

    let history = recv_request(ws).await;
    assert_eq!(history["method"], "chat.history");
    assert_eq!(history["params"]["sessionKey"], "main");
    respond(ws, &history["id"], json!({"messages": []})).await;
}

fn client_for(
    gateway: &FakeGateway,
    dir: &tempfile::TempDir,
    tune: impl FnOnce(GatewayConfig) -> GatewayConfig,
) -> (Arc<GatewayClient>, mpsc::UnboundedReceiver<ClientEvent>) {
    let config = tune(
        GatewayConfig::new(gateway.url.clone())
            .with_key_path(dir.path().join("device_keys.json"))
            .with_reconnect_delays(50, 200),
    );
    let (tx, rx) = mpsc::unbounded_channel::<ClientEvent>();
    let client = GatewayClient::new(config, Arc::new(tx)).unwrap();
    client.start().unwrap();
    (Arc::new(client), rx)
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut matches: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("listener channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

async fn wait_connected(events: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    wait_for(events, |e| {
        matches!(e, ClientEvent::ConnectionChanged(ConnectionState::Connected))
    })
    .await;
}

fn id_of(frame: &Value) -> u64 {
    frame["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signed_handshake_then_chat_round_trip() {
    let gateway = FakeGateway::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = client_for(&gateway, &dir, |c| c);

    let mut ws = gateway.accept().await;
    handshake(&mut ws, "abc").await;
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;

    assert_eq!(client.status().model, "test-model");
    assert_eq!(client.session().unwrap().session_key, "main");
    assert_eq!(client.gateway_info().uptime_ms, Some(1234));

    client.send_message("ping").unwrap();
    let send = recv_request(&mut ws).await;
    assert_eq!(send["method"], "chat.send");
    assert_eq!(send["params"]["message"], "ping");
    assert_eq!(send["params"]["sessionKey"], "main");
    respond(&mut ws, &send["id"], json!({"runId": "run-1", "status": "started"})).await;

    send_event(&mut ws, "agent", json!({"runId": "run-1", "stream": "lifecycle", "data": {"phase": "start"}})).await;
    send_event(&mut ws, "agent", json!({"runId": "run-1", "stream": "assistant", "data": {"delta": "po"}})).await;
    send_event(&mut ws, "agent", json!({"runId": "run-1", "stream": "assistant", "data": {"delta": "ng"}})).await;
    send_event(
        &mut ws,
        "chat",
        json!({"runId": "run-1", "state": "final", "message": {"role": "assistant", "content": [{"type": "text", "text": "pong"}]}}),
    )
    .await;
    send_event(&mut ws, "agent", json!({"runId": "run-1", "stream": "lifecycle", "data": {"phase": "end"}})).await;

    let complete = wait_for(&mut events, |e| matches!(e, ClientEvent::MessageComplete(_))).await;
    let ClientEvent::MessageComplete(message) = complete else {
        unreachable!()
    };
    assert_eq!(message.role, "assistant");
    assert_eq!(message.content, "pong");

    // Only one completion per run
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::StatusChanged(s) if s.current_task == "Idle")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ClientEvent::MessageComplete(_)));
    }

    let log = client.messages();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].content, "pong");
    assert!(client.current_streaming().is_none());

    let stopper = Arc::clone(&client);
    tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blocking_request_and_timeout() {
    let gateway = FakeGateway::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = client_for(&gateway, &dir, |c| c.with_request_timeout(300));

    let mut ws = gateway.accept().await;
    handshake(&mut ws, "n-1").await;
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;

    // Answered request
    let caller = Arc::clone(&client);
    let answered = tokio::task::spawn_blocking(move || caller.request("runs.list", Some(json!({}))));
    let request = recv_request(&mut ws).await;
    assert_eq!(request["method"], "runs.list");
    respond(&mut ws, &request["id"], json!({"runs": [{"id": "r1"}]})).await;
    let payload = answered.await.unwrap().unwrap();
    assert_eq!(payload["runs"][0]["id"], "r1");

    // Unanswered request times out, connection survives
    let caller = Arc::clone(&client);
    let unanswered = tokio::task::spawn_blocking(move || caller.request("cron.list", None));
    let late = recv_request(&mut ws).await;
    assert!(id_of(&late) > id_of(&request));
    match unanswered.await.unwrap() {
        Err(GatewayError::RequestTimeout { method, timeout_ms }) => {
            assert_eq!(method, "cron.list");
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    respond(&mut ws, &late["id"], json!({})).await;
    assert_eq!(client.state(), ConnectionState::Connected);

    // Rejected request carries the gateway error
    let caller = Arc::clone(&client);
    let rejected = tokio::task::spawn_blocking(move || caller.request("nope", None));
    let request = recv_request(&mut ws).await;
    send(
        &mut ws,
        json!({"type": "res", "id": request["id"], "ok": false, "error": {"code": "UNKNOWN_METHOD", "message": "no such method"}}),
    )
    .await;
    match rejected.await.unwrap() {
        Err(GatewayError::RequestFailed { code, message, .. }) => {
            assert_eq!(code, "UNKNOWN_METHOD");
            assert_eq!(message, "no such method");
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let stopper = Arc::clone(&client);
    tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pairing_required_keeps_retrying() {
    let gateway = FakeGateway::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = client_for(&gateway, &dir, |c| c);

    let mut ws = gateway.accept().await;
    send_event(&mut ws, "connect.challenge", json!({"nonce": "abc"})).await;
    let connect = recv_request(&mut ws).await;
    send_event(&mut ws, "device.pairing.required", json!({"deviceId": "x"})).await;
    send(
        &mut ws,
        json!({"type": "res", "id": connect["id"], "ok": false, "error": {"code": "NOT_PAIRED", "message": "device not paired"}}),
    )
    .await;

    let pairing = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Notification(n) if n.title == "Pairing Required")
    })
    .await;
    let ClientEvent::Notification(pairing) = pairing else {
        unreachable!()
    };
    assert_eq!(pairing.kind, NotificationKind::Warning);
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ConnectionChanged(ConnectionState::Reconnecting))
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Notification(n) if n.title == "Reconnecting" && n.message.starts_with("Attempt 1 in"))
    })
    .await;

    // The client comes back and a later handshake succeeds with a fresh id
    let mut ws = gateway.accept().await;
    let second = handshake(&mut ws, "def").await;
    assert!(id_of(&second) > id_of(&connect));
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;

    let stopper = Arc::clone(&client);
    tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnects_after_stream_loss() {
    let gateway = FakeGateway::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = client_for(&gateway, &dir, |c| c);

    let mut ws = gateway.accept().await;
    let first = handshake(&mut ws, "one").await;
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;
    let device_id = client.device_id().to_string();

    // In-flight request fails when the stream drops
    let caller = Arc::clone(&client);
    let in_flight = tokio::task::spawn_blocking(move || caller.request("runs.list", None));
    recv_request(&mut ws).await;
    drop(ws);

    assert!(matches!(
        in_flight.await.unwrap(),
        Err(GatewayError::ConnectionLost)
    ));
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ConnectionChanged(ConnectionState::Reconnecting))
    })
    .await;

    let mut ws = gateway.accept().await;
    let second = handshake(&mut ws, "two").await;
    assert!(id_of(&second) > id_of(&first));
    assert_eq!(second["params"]["device"]["id"], device_id);
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;

    let stopper = Arc::clone(&client);
    tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_approval_flow_and_forced_reconnect() {
    let gateway = FakeGateway::bind().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, mut events) = client_for(&gateway, &dir, |c| c);

    let mut ws = gateway.accept().await;
    handshake(&mut ws, "abc").await;
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;

    send_event(
        &mut ws,
        "exec.approval.requested",
        json!({"id": "ap-1", "tool": "bash", "args": {"cmd": "ls"}, "runId": "run-9"}),
    )
    .await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::ApprovalRequested(a) if a.id == "ap-1")).await;
    assert_eq!(client.pending_approvals().len(), 1);

    client.respond_approval("ap-1", true).unwrap();
    let respond_frame = recv_request(&mut ws).await;
    assert_eq!(respond_frame["method"], "exec.approval.respond");
    assert_eq!(respond_frame["params"], json!({"id": "ap-1", "approved": true}));
    assert!(client.pending_approvals().is_empty());

    client.force_reconnect().unwrap();
    let mut ws = gateway.accept().await;
    handshake(&mut ws, "again").await;
    serve_setup(&mut ws).await;
    wait_connected(&mut events).await;

    let stopper = Arc::clone(&client);
    tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();
}
