use crate::core::config::GatewayConfig;
use crate::core::errors::GatewayError;
use crate::core::kernel::{Backoff, WsSession};
use crate::core::types::{ConnectionState, Notification, SessionContext};
use crate::gateway::auth::{connect_rejection, ConnectParams, HelloSnapshot};
use crate::gateway::codec::{Frame, GatewayCodec, RequestFrame};
use crate::gateway::events::{GatewayEvent, EVENT_CONNECT_CHALLENGE, EVENT_PAIRED, EVENT_PAIRING_REQUIRED};
use crate::gateway::identity::DeviceIdentity;
use crate::gateway::pending::{Reply, RequestResult};
use crate::gateway::router::EventRouter;
use crate::gateway::session::{parse_history, parse_sessions, select_session};
use crate::gateway::state::{ClientShared, SharedState};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, timeout_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Work marshalled from caller threads onto the protocol loop
#[derive(Debug)]
pub enum Command {
    /// Any method; `reply: None` makes it fire-and-forget
    Request {
        method: String,
        params: Option<Value>,
        reply: Option<Reply>,
    },
    SendChat {
        text: String,
    },
    Abort,
    RespondApproval {
        id: String,
        approved: bool,
    },
    FetchRuns,
    FetchCron,
    Reconnect,
}

/// Why a connection cycle ended
#[derive(Debug)]
enum CycleEnd {
    Shutdown,
    Reconnect,
    Lost(GatewayError),
}

/// Outcome of waiting while disconnected
#[derive(Debug, PartialEq, Eq)]
enum Idle {
    Retry,
    Shutdown,
}

/// The protocol loop: connect, handshake, session setup, then serve frames and
/// commands until the stream fails, reconnecting with backoff.
///
/// Everything here runs on one task; shared state is only touched through
/// [`ClientShared`].
pub struct Connection<W: WsSession<GatewayCodec>> {
    config: GatewayConfig,
    identity: Arc<DeviceIdentity>,
    shared: Arc<ClientShared>,
    ws: W,
    commands: mpsc::UnboundedReceiver<Command>,
    router: EventRouter,
    session: Option<SessionContext>,
    backoff: Backoff,
}

impl<W: WsSession<GatewayCodec>> Connection<W> {
    pub fn new(
        config: GatewayConfig,
        identity: Arc<DeviceIdentity>,
        shared: Arc<ClientShared>,
        ws: W,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
        );
        Self {
            config,
            identity,
            shared,
            ws,
            commands,
            router: EventRouter::new(),
            session: None,
            backoff,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            () = self.supervise() => {}
            _ = shutdown.changed() => debug!("Shutdown requested"),
        }

        let _ = self.ws.close().await;
        let failed = self.shared.lock().pending.fail_all();
        if failed > 0 {
            debug!(count = failed, "Failed pending requests on shutdown");
        }
        self.router.reset(&self.shared);
        self.shared.update_status(|s| s.is_streaming = false);
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Gateway client stopped");
    }

    async fn supervise(&mut self) {
        loop {
            let error = match self.cycle().await {
                CycleEnd::Shutdown => return,
                CycleEnd::Reconnect => {
                    info!("Forced reconnect");
                    self.drop_connection().await;
                    self.shared.notify(Notification::info("Reconnecting", "Forced reconnect", 2.0));
                    continue;
                }
                CycleEnd::Lost(error) => error,
            };

            let was_connected = self.shared.state() == ConnectionState::Connected;
            self.drop_connection().await;

            if error.is_fatal() {
                warn!("Gateway connection failed permanently: {}", error);
                self.shared.set_state(ConnectionState::Failed);
                self.shared
                    .notify(Notification::error("Connection Failed", error.to_string(), 10.0));
                // Only an explicit reconnect leaves the failed state
                match self.idle(None).await {
                    Idle::Retry => {
                        self.backoff.reset();
                        continue;
                    }
                    Idle::Shutdown => return,
                }
            }

            self.report_loss(&error, was_connected);
            self.shared.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            self.shared.notify(Notification::warning(
                "Reconnecting",
                format!("Attempt {} in {}", self.backoff.attempt(), format_delay(delay)),
                delay.as_secs_f64().clamp(1.0, 5.0),
            ));
            if self.idle(Some(delay)).await == Idle::Shutdown {
                return;
            }
        }
    }

    fn report_loss(&self, error: &GatewayError, was_connected: bool) {
        match error {
            GatewayError::PairingRequired(message) => {
                warn!(device_id = %self.identity.short_id(), "Pairing required: {}", message);
                self.shared.notify(Notification::warning(
                    "Pairing Required",
                    format!("Approve device {} on the gateway", self.identity.short_id()),
                    10.0,
                ));
            }
            GatewayError::HandshakeFailed(message) => {
                warn!("Handshake failed: {}", message);
                self.shared
                    .notify(Notification::error("Handshake Failed", message.clone(), 5.0));
            }
            other if was_connected => {
                warn!("Connection lost: {}", other);
                self.shared
                    .notify(Notification::warning("Disconnected", other.to_string(), 3.0));
            }
            other => debug!("Connect attempt failed: {}", other),
        }
    }

    async fn drop_connection(&mut self) {
        let _ = self.ws.close().await;
        self.shared.lock().pending.fail_all();
        self.router.reset(&self.shared);
        self.shared.update_status(|s| s.is_streaming = false);
    }

    /// One connect, handshake, setup and serve pass
    async fn cycle(&mut self) -> CycleEnd {
        self.shared.set_state(ConnectionState::Connecting);

        if let Err(e) = self.ws.connect().await {
            return CycleEnd::Lost(e);
        }
        let hello = match self.handshake().await {
            Ok(hello) => hello,
            Err(e) => return CycleEnd::Lost(e),
        };
        self.backoff.reset();
        self.apply_hello(hello);

        if let Err(e) = self.setup_session().await {
            return CycleEnd::Lost(e);
        }

        self.shared.set_state(ConnectionState::Connected);
        self.shared
            .notify(Notification::success("Connected", self.config.url.clone(), 2.0));

        self.serve().await
    }

    #[instrument(skip(self), fields(url = %self.config.url))]
    async fn handshake(&mut self) -> Result<HelloSnapshot, GatewayError> {
        let wait = self.config.handshake_timeout();

        let first = timeout(wait, self.ws.next_message()).await.map_err(|_| {
            GatewayError::HandshakeFailed(format!(
                "no connect challenge within {}ms",
                self.config.handshake_timeout_ms
            ))
        })?;
        let nonce = match first {
            Some(Ok(Frame::Event(event))) if event.event == EVENT_CONNECT_CHALLENGE => {
                match GatewayEvent::from_frame(&event) {
                    GatewayEvent::ConnectChallenge(challenge) if !challenge.nonce.is_empty() => {
                        challenge.nonce
                    }
                    _ => {
                        return Err(GatewayError::HandshakeFailed(
                            "connect challenge carried no nonce".to_string(),
                        ))
                    }
                }
            }
            Some(Ok(other)) => {
                return Err(GatewayError::HandshakeFailed(format!(
                    "expected connect challenge, got {}",
                    frame_kind(&other)
                )))
            }
            Some(Err(GatewayError::DecodeError(e))) => {
                return Err(GatewayError::HandshakeFailed(format!(
                    "unreadable challenge: {}",
                    e
                )))
            }
            Some(Err(e)) => return Err(e),
            None => return Err(GatewayError::ConnectionLost),
        };
        debug!(nonce = %nonce, "Received connect challenge");

        let signed_at = Utc::now().timestamp_millis();
        let params = ConnectParams::signed(&self.config, &self.identity, &nonce, signed_at).to_value()?;
        let id = self.shared.lock().pending.next_id();
        self.ws
            .send_frame(&Frame::Request(RequestFrame::new(
                id.clone(),
                "connect",
                Some(params),
            )))
            .await?;

        // Bounded as a whole, not per frame
        let deadline = Instant::now() + wait;
        loop {
            let frame = timeout_at(deadline, self.ws.next_message()).await.map_err(|_| {
                GatewayError::HandshakeFailed(format!(
                    "no connect response within {}ms",
                    self.config.handshake_timeout_ms
                ))
            })?;
            match frame {
                Some(Ok(Frame::Response(response))) if response.id == id => {
                    if !response.ok {
                        return Err(connect_rejection(&response));
                    }
                    let payload = response.payload.unwrap_or(Value::Null);
                    info!(device_id = %self.identity.short_id(), "Handshake complete");
                    return Ok(HelloSnapshot::from_payload(&payload));
                }
                Some(Ok(Frame::Event(event))) => match event.event.as_str() {
                    EVENT_PAIRING_REQUIRED | EVENT_PAIRED => {
                        self.router
                            .dispatch(GatewayEvent::from_frame(&event), &self.shared);
                    }
                    other => debug!(event = other, "Ignoring event during handshake"),
                },
                Some(Ok(other)) => debug!(kind = frame_kind(&other), "Ignoring frame during handshake"),
                Some(Err(GatewayError::DecodeError(e))) => warn!("Dropping malformed frame: {}", e),
                Some(Err(e)) => return Err(e),
                None => return Err(GatewayError::ConnectionLost),
            }
        }
    }

    fn apply_hello(&self, hello: HelloSnapshot) {
        if let Some(session_id) = &hello.session_id {
            debug!(session_id = %session_id, "Gateway assigned session");
        }
        let mut state = self.shared.lock();
        state.gateway_info = hello.gateway_info;
        if !hello.presence.is_empty() {
            state.presence = hello.presence;
        }
        if hello.health.is_some() {
            state.health = hello.health;
        }
    }

    /// Pick a session and seed the message log from its history. Request
    /// failures are logged; only transport errors abort the connection.
    async fn setup_session(&mut self) -> Result<(), GatewayError> {
        let wait = self.config.setup_timeout();

        let sessions = match self.call("sessions.list", Some(json!({})), wait).await {
            Ok(payload) => parse_sessions(&payload),
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                warn!("sessions.list failed: {}", e);
                Vec::new()
            }
        };
        info!(count = sessions.len(), "Discovered sessions");

        let Some(context) = select_session(&sessions).map(|s| s.context()) else {
            warn!("No session available; chat requests will be rejected");
            self.session = None;
            self.shared.lock().session = None;
            return Ok(());
        };
        info!(session = %context.session_key, model = %context.model, "Using session");

        let model = context.model.clone();
        let params = json!({"sessionKey": context.session_key});
        self.shared.lock().session = Some(context.clone());
        self.session = Some(context);
        self.shared.update_status(|s| s.model = model);

        match self.call("chat.history", Some(params), wait).await {
            Ok(payload) => {
                let history = parse_history(&payload, self.config.history_limit);
                let loaded = history.len();
                let mut state = self.shared.lock();
                state.messages.clear();
                for message in history {
                    state.push_message(message);
                }
                drop(state);
                info!(count = loaded, "Loaded chat history");
            }
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => warn!("chat.history unavailable: {}", e),
        }
        Ok(())
    }

    async fn serve(&mut self) -> CycleEnd {
        // A reconnect queued while connecting was satisfied by this connection
        loop {
            match self.commands.try_recv() {
                Ok(Command::Reconnect) => debug!("Discarding reconnect queued during connect"),
                Ok(command) => {
                    if let Err(e) = self.handle_command(command).await {
                        return CycleEnd::Lost(e);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return CycleEnd::Shutdown,
            }
        }

        let mut heartbeat = heartbeat_interval(self.config.heartbeat_interval());

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => return CycleEnd::Shutdown,
                    Some(Command::Reconnect) => return CycleEnd::Reconnect,
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            return CycleEnd::Lost(e);
                        }
                    }
                },
                frame = self.ws.next_message() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),
                    Some(Err(GatewayError::DecodeError(e))) => warn!("Dropping malformed frame: {}", e),
                    Some(Err(e)) => return CycleEnd::Lost(e),
                    None => return CycleEnd::Lost(GatewayError::ConnectionLost),
                },
                () = tick(&mut heartbeat) => {
                    if let Err(e) = self.ws.send_ping().await {
                        return CycleEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Wait out a backoff delay (or forever with `None`) while answering commands
    async fn idle(&mut self, delay: Option<Duration>) -> Idle {
        let deadline = delay.map(|d| Instant::now() + d);
        loop {
            let sleeper = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = sleeper => return Idle::Retry,
                command = self.commands.recv() => match command {
                    None => return Idle::Shutdown,
                    Some(Command::Reconnect) => return Idle::Retry,
                    Some(command) => self.reject(command),
                },
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                self.shared.lock().pending.resolve(response);
            }
            Frame::Event(event) => {
                let event = GatewayEvent::from_frame(&event);
                debug!(event = event.name(), "Event received");
                self.router.dispatch(event, &self.shared);
            }
            Frame::Request(request) => {
                debug!(id = %request.id, method = %request.method, "Ignoring server request");
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), GatewayError> {
        match command {
            Command::Request {
                method,
                params,
                reply,
            } => {
                self.send_request(&method, params, reply, self.config.request_timeout())
                    .await?;
            }
            Command::SendChat { text } => {
                let Some(session) = &self.session else {
                    warn!("Dropping chat message: no active session");
                    self.shared.notify(Notification::error(
                        "Not Sent",
                        "No active session on the gateway",
                        3.0,
                    ));
                    return Ok(());
                };
                let params = json!({
                    "message": text,
                    "idempotencyKey": uuid::Uuid::new_v4().to_string(),
                    "sessionKey": session.session_key,
                });
                info!(chars = text.len(), session = %session.session_key, "Sending chat.send");
                self.send_request("chat.send", Some(params), None, self.config.request_timeout())
                    .await?;
            }
            Command::Abort => {
                let params = match &self.session {
                    Some(session) => json!({"sessionKey": session.session_key}),
                    None => json!({}),
                };
                self.send_request("chat.abort", Some(params), None, self.config.request_timeout())
                    .await?;
                self.shared.notify(Notification::warning("Cancelling...", "", 1.0));
            }
            Command::RespondApproval { id, approved } => {
                self.shared.lock().approvals.retain(|a| a.id != id);
                let params = json!({"id": id, "approved": approved});
                self.send_request(
                    "exec.approval.respond",
                    Some(params),
                    None,
                    self.config.request_timeout(),
                )
                .await?;
                let action = if approved { "Approved" } else { "Denied" };
                self.shared
                    .notify(Notification::info(format!("Tool {}", action), "", 2.0));
            }
            Command::FetchRuns => {
                let rx = self.send_tracked("runs.list").await?;
                spawn_list_refresh(Arc::clone(&self.shared), rx, "runs", |state, items| {
                    state.runs = items;
                });
            }
            Command::FetchCron => {
                let rx = self.send_tracked("cron.list").await?;
                spawn_list_refresh(Arc::clone(&self.shared), rx, "jobs", |state, items| {
                    state.cron = items;
                });
            }
            Command::Reconnect => {}
        }
        Ok(())
    }

    async fn send_tracked(
        &mut self,
        method: &str,
    ) -> Result<oneshot::Receiver<RequestResult>, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(method, Some(json!({})), Some(tx), self.config.request_timeout())
            .await?;
        Ok(rx)
    }

    /// Register a slot, write the frame, and arm the timeout
    async fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        reply: Option<Reply>,
        wait: Duration,
    ) -> Result<String, GatewayError> {
        let id = self.write_request(method, params, reply).await?;
        let shared = Arc::clone(&self.shared);
        let timer_id = id.clone();
        tokio::spawn(async move {
            sleep(wait).await;
            if shared.lock().pending.expire(&timer_id, wait) {
                warn!(id = %timer_id, "Request timed out");
            }
        });
        Ok(id)
    }

    async fn write_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        reply: Option<Reply>,
    ) -> Result<String, GatewayError> {
        let id = {
            let mut state = self.shared.lock();
            let id = state.pending.next_id();
            state.pending.register(id.clone(), method, reply);
            id
        };
        debug!(id = %id, method, "Sending request");

        let frame = Frame::Request(RequestFrame::new(id.clone(), method, params));
        if let Err(e) = self.ws.send_frame(&frame).await {
            self.shared.lock().pending.fail(&id, GatewayError::ConnectionLost);
            return Err(e);
        }
        Ok(id)
    }

    /// Request/response inline on the loop, still routing whatever else arrives
    async fn call(
        &mut self,
        method: &str,
        params: Option<Value>,
        wait: Duration,
    ) -> Result<Value, GatewayError> {
        let (tx, mut rx) = oneshot::channel();
        let id = self.write_request(method, params, Some(tx)).await?;
        let deadline = sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                result = &mut rx => return result.unwrap_or(Err(GatewayError::ChannelClosed)),
                frame = self.ws.next_message() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame),
                    Some(Err(GatewayError::DecodeError(e))) => warn!("Dropping malformed frame: {}", e),
                    Some(Err(e)) => return Err(e),
                    None => return Err(GatewayError::ConnectionLost),
                },
                () = &mut deadline => {
                    self.shared.lock().pending.expire(&id, wait);
                    return rx.try_recv().unwrap_or_else(|_| Err(GatewayError::RequestTimeout {
                        method: method.to_string(),
                        timeout_ms: wait.as_millis() as u64,
                    }));
                }
            }
        }
    }

    /// Answer a command that arrived while there is no stream to send it on
    fn reject(&self, command: Command) {
        match command {
            Command::Request { method, reply, .. } => {
                warn!(method = %method, "Rejecting request while disconnected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(GatewayError::NotConnected));
                }
            }
            Command::SendChat { text } => {
                warn!(chars = text.len(), "Dropping chat message while disconnected");
                self.shared.notify(Notification::error(
                    "Not Sent",
                    "Not connected to the gateway",
                    3.0,
                ));
            }
            Command::Reconnect => {}
            other => warn!(command = ?other, "Dropping command while disconnected"),
        }
    }
}

fn spawn_list_refresh(
    shared: Arc<ClientShared>,
    rx: oneshot::Receiver<RequestResult>,
    field: &'static str,
    apply: fn(&mut SharedState, Vec<Value>),
) {
    tokio::spawn(async move {
        match rx.await {
            Ok(Ok(payload)) => {
                let items = list_field(&payload, field);
                debug!(field, count = items.len(), "Refreshed list");
                apply(&mut shared.lock(), items);
            }
            Ok(Err(e)) => warn!(field, "List refresh failed: {}", e),
            Err(_) => {}
        }
    });
}

/// `payload[field]` when it is a list, else the payload itself when it is one
fn list_field(payload: &Value, field: &str) -> Vec<Value> {
    payload
        .get(field)
        .unwrap_or(payload)
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn frame_kind(frame: &Frame) -> String {
    match frame {
        Frame::Request(r) => format!("request {}", r.method),
        Frame::Response(r) => format!("response {}", r.id),
        Frame::Event(e) => format!("event {}", e.event),
    }
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{:.1}s", delay.as_secs_f64())
    }
}

fn heartbeat_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::ClientEvent;
    use crate::core::types::NotificationKind;
    use crate::gateway::codec::{EventFrame, ResponseFrame};
    use async_trait::async_trait;
    use tokio_tungstenite::tungstenite::Message;

    /// In-memory transport: the test plays the gateway through two channels
    struct ScriptedWs {
        inbound: mpsc::UnboundedReceiver<Frame>,
        outbound: mpsc::UnboundedSender<Frame>,
        connected: bool,
    }

    #[async_trait]
    impl WsSession<GatewayCodec> for ScriptedWs {
        async fn connect(&mut self) -> Result<(), GatewayError> {
            self.connected = true;
            Ok(())
        }

        async fn send_raw(&mut self, _msg: Message) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn next_raw(&mut self) -> Option<Result<Message, GatewayError>> {
            None
        }

        async fn close(&mut self) -> Result<(), GatewayError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn send_frame(&mut self, frame: &Frame) -> Result<(), GatewayError> {
            self.outbound
                .send(frame.clone())
                .map_err(|_| GatewayError::NetworkError("peer gone".to_string()))
        }

        async fn next_message(&mut self) -> Option<Result<Frame, GatewayError>> {
            self.inbound.recv().await.map(Ok)
        }
    }

    struct Harness {
        to_client: mpsc::UnboundedSender<Frame>,
        from_client: mpsc::UnboundedReceiver<Frame>,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        shared: Arc<ClientShared>,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn push_event(&self, name: &str, payload: Value) {
            self.to_client
                .send(Frame::Event(EventFrame::new(name, payload)))
                .unwrap();
        }

        fn respond(&self, id: &str, payload: Value) {
            self.to_client
                .send(Frame::Response(ResponseFrame {
                    id: id.to_string(),
                    ok: true,
                    payload: Some(payload),
                    error: None,
                }))
                .unwrap();
        }

        async fn next_request(&mut self) -> RequestFrame {
            match timeout(Duration::from_secs(5), self.from_client.recv()).await {
                Ok(Some(Frame::Request(request))) => request,
                other => panic!("expected request, got {:?}", other),
            }
        }

        async fn wait_for_state(&mut self, wanted: ConnectionState) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.shared.state() == wanted {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
            panic!("state never became {}", wanted);
        }

        /// Challenge, connect, sessions.list, chat.history
        async fn complete_handshake(&mut self) -> String {
            self.push_event("connect.challenge", json!({"nonce": "abc", "ts": 1}));
            let connect = self.next_request().await;
            assert_eq!(connect.method, "connect");
            self.respond(&connect.id, json!({"snapshot": {"uptimeMs": 10}}));

            let sessions = self.next_request().await;
            assert_eq!(sessions.method, "sessions.list");
            self.respond(
                &sessions.id,
                json!({"sessions": [{"key": "main", "kind": "direct", "displayName": "Main", "model": "m1"}]}),
            );

            let history = self.next_request().await;
            assert_eq!(history.method, "chat.history");
            self.respond(
                &history.id,
                json!({"messages": [{"role": "user", "content": "earlier"}]}),
            );
            self.wait_for_state(ConnectionState::Connected).await;
            connect.id
        }
    }

    fn start(config: GatewayConfig) -> Harness {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel::<ClientEvent>();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ClientShared::new(config.max_messages, Arc::new(events_tx)));

        let ws = ScriptedWs {
            inbound,
            outbound,
            connected: false,
        };
        let connection = Connection::new(
            config,
            Arc::new(DeviceIdentity::generate()),
            Arc::clone(&shared),
            ws,
            commands_rx,
        );
        tokio::spawn(connection.run(shutdown_rx));

        Harness {
            to_client,
            from_client,
            commands: commands_tx,
            events,
            shared,
            shutdown,
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig::new("ws://gateway.test")
            .with_handshake_timeouts(2_000, 500)
            .with_reconnect_delays(10, 50)
    }

    #[tokio::test]
    async fn test_handshake_and_session_setup() {
        let mut h = start(config());
        let connect_id = h.complete_handshake().await;
        assert_eq!(connect_id, "1");

        let state = h.shared.lock();
        assert_eq!(state.session.as_ref().unwrap().session_key, "main");
        assert_eq!(state.status.model, "m1");
        assert_eq!(state.gateway_info.uptime_ms, Some(10));
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].content, "earlier");
    }

    #[tokio::test]
    async fn test_send_chat_uses_session_and_fresh_ids() {
        let mut h = start(config());
        h.complete_handshake().await;

        h.commands
            .send(Command::SendChat {
                text: "ping".to_string(),
            })
            .unwrap();
        let first = h.next_request().await;
        assert_eq!(first.method, "chat.send");
        let params = first.params.clone().unwrap();
        assert_eq!(params["message"], "ping");
        assert_eq!(params["sessionKey"], "main");
        assert!(params["idempotencyKey"].as_str().is_some());

        h.commands
            .send(Command::SendChat {
                text: "again".to_string(),
            })
            .unwrap();
        let second = h.next_request().await;
        assert!(second.id.parse::<u64>().unwrap() > first.id.parse::<u64>().unwrap());
        assert_ne!(params["idempotencyKey"], second.params.unwrap()["idempotencyKey"]);
    }

    #[tokio::test]
    async fn test_request_times_out_without_dropping_connection() {
        let mut h = start(config().with_request_timeout(50));
        h.complete_handshake().await;

        let (tx, rx) = oneshot::channel();
        h.commands
            .send(Command::Request {
                method: "runs.list".to_string(),
                params: None,
                reply: Some(tx),
            })
            .unwrap();
        let request = h.next_request().await;

        let result = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(GatewayError::RequestTimeout { .. })));
        assert_eq!(h.shared.state(), ConnectionState::Connected);

        // A late answer is discarded
        h.respond(&request.id, json!({}));
        sleep(Duration::from_millis(20)).await;
        assert!(h.shared.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_pairing_rejection_schedules_reconnect() {
        let mut h = start(config().with_reconnect_delays(1_000, 5_000));
        h.push_event("connect.challenge", json!({"nonce": "abc"}));
        let connect = h.next_request().await;
        h.to_client
            .send(Frame::Response(ResponseFrame {
                id: connect.id,
                ok: false,
                payload: None,
                error: Some(json!({"code": "NOT_PAIRED", "message": "pairing required"})),
            }))
            .unwrap();
        h.wait_for_state(ConnectionState::Reconnecting).await;

        let mut titles = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let ClientEvent::Notification(n) = event {
                titles.push((n.title, n.message));
            }
        }
        assert!(titles.iter().any(|(t, _)| t == "Pairing Required"));
        assert!(titles
            .iter()
            .any(|(t, m)| t == "Reconnecting" && m.starts_with("Attempt 1 in")));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let mut h = start(config());
        h.complete_handshake().await;

        let (tx, rx) = oneshot::channel();
        h.commands
            .send(Command::Request {
                method: "cron.list".to_string(),
                params: None,
                reply: Some(tx),
            })
            .unwrap();
        h.next_request().await;
        h.shutdown.send(true).unwrap();

        let result = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(GatewayError::ConnectionLost)));
        h.wait_for_state(ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_refresh_runs_replaces_cache() {
        let mut h = start(config());
        h.complete_handshake().await;

        h.commands.send(Command::FetchRuns).unwrap();
        let request = h.next_request().await;
        assert_eq!(request.method, "runs.list");
        h.respond(&request.id, json!({"runs": [{"id": "r1"}, {"id": "r2"}]}));

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.shared.lock().runs.len() != 2 {
            assert!(Instant::now() < deadline, "runs never refreshed");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_chat_queued_while_reconnecting_is_reported() {
        let mut h = start(config().with_reconnect_delays(1_000, 5_000));
        h.push_event("connect.challenge", json!({"nonce": "abc"}));
        let connect = h.next_request().await;
        h.to_client
            .send(Frame::Response(ResponseFrame {
                id: connect.id,
                ok: false,
                payload: None,
                error: Some(json!({"code": "INVALID_REQUEST", "message": "rejected"})),
            }))
            .unwrap();
        h.wait_for_state(ConnectionState::Reconnecting).await;

        h.commands
            .send(Command::SendChat {
                text: "lost?".to_string(),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let event = timeout_at(deadline, h.events.recv())
                .await
                .expect("no Not Sent notification")
                .unwrap();
            if let ClientEvent::Notification(n) = event {
                if n.title == "Not Sent" {
                    assert_eq!(n.kind, NotificationKind::Error);
                    break;
                }
            }
        }
        assert!(h.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_response_wait_has_overall_deadline() {
        let mut h = start(
            config()
                .with_handshake_timeouts(200, 500)
                .with_reconnect_delays(1_000, 5_000),
        );
        h.push_event("connect.challenge", json!({"nonce": "abc"}));
        h.next_request().await;

        // Ticks arrive faster than the handshake timeout but never the response
        let ticker = h.to_client.clone();
        let ticks = tokio::spawn(async move {
            loop {
                if ticker
                    .send(Frame::Event(EventFrame::new("tick", json!({"ts": 1}))))
                    .is_err()
                {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        });

        h.wait_for_state(ConnectionState::Reconnecting).await;
        ticks.abort();

        let mut handshake_failed = false;
        while let Ok(event) = h.events.try_recv() {
            if let ClientEvent::Notification(n) = event {
                handshake_failed |= n.title == "Handshake Failed";
            }
        }
        assert!(handshake_failed);
    }

    #[tokio::test]
    async fn test_reconnect_queued_during_connect_is_discarded() {
        let mut h = start(config());
        h.commands.send(Command::Reconnect).unwrap();
        h.complete_handshake().await;

        h.commands
            .send(Command::SendChat {
                text: "ping".to_string(),
            })
            .unwrap();
        let request = h.next_request().await;
        assert_eq!(request.method, "chat.send");
        assert_eq!(h.shared.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_list_field_shapes() {
        assert_eq!(list_field(&json!({"jobs": [1, 2]}), "jobs").len(), 2);
        assert_eq!(list_field(&json!([1, 2, 3]), "jobs").len(), 3);
        assert!(list_field(&json!({"jobs": "nope"}), "jobs").is_empty());
    }

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay(Duration::from_secs(4)), "4s");
        assert_eq!(format_delay(Duration::from_millis(1500)), "1.5s");
    }
}
