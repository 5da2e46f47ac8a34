use crate::core::config::GatewayConfig;
use crate::core::errors::GatewayError;
use crate::core::kernel::{TungsteniteWs, WsConfig};
use crate::core::traits::GatewayListener;
use crate::core::types::{
    Approval, ChatMessage, ClientStatus, ConnectionState, GatewayInfo, Notification,
    SessionContext, StreamingMessage,
};
use crate::gateway::codec::GatewayCodec;
use crate::gateway::connection::{Command, Connection};
use crate::gateway::identity::DeviceIdentity;
use crate::gateway::pending::ResponseHandle;
use crate::gateway::state::ClientShared;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

const WORKER_THREAD_NAME: &str = "clawlink-gateway";

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Thread-safe handle to one gateway connection.
///
/// [`start`](Self::start) spawns a worker thread that owns all network I/O;
/// every other method can be called from any thread and either hands work to
/// that thread or reads a snapshot of the shared state.
///
/// ```rust,no_run
/// use clawlink::{GatewayClient, GatewayConfig, NoopListener};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), clawlink::GatewayError> {
/// let client = GatewayClient::new(GatewayConfig::new("ws://localhost:18789"), Arc::new(NoopListener))?;
/// client.start()?;
/// // ... once connected
/// client.send_message("hello")?;
/// client.stop();
/// # Ok(())
/// # }
/// ```
pub struct GatewayClient {
    config: GatewayConfig,
    identity: Arc<DeviceIdentity>,
    shared: Arc<ClientShared>,
    worker: Mutex<Option<Worker>>,
}

impl GatewayClient {
    /// Create a client, loading (or generating) the device key at `config.key_path`
    pub fn new(
        config: GatewayConfig,
        listener: Arc<dyn GatewayListener>,
    ) -> Result<Self, GatewayError> {
        let identity = DeviceIdentity::load_or_generate(&config.key_path)?;
        Ok(Self::with_identity(config, identity, listener))
    }

    pub fn with_identity(
        config: GatewayConfig,
        identity: DeviceIdentity,
        listener: Arc<dyn GatewayListener>,
    ) -> Self {
        let shared = Arc::new(ClientShared::new(config.max_messages, listener));
        Self {
            config,
            identity: Arc::new(identity),
            shared,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread and begin connecting. No-op if already running.
    pub fn start(&self) -> Result<(), GatewayError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let identity = Arc::clone(&self.identity);
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build runtime: {}", e);
                        shared.set_state(ConnectionState::Failed);
                        shared.notify(Notification::error("Connection Failed", e.to_string(), 10.0));
                        return;
                    }
                };

                let ws = TungsteniteWs::new(config.url.clone(), GatewayCodec::new()).with_config(
                    WsConfig {
                        connect_timeout_ms: config.connect_timeout_ms,
                    },
                );
                let connection = Connection::new(config, identity, shared, ws, commands_rx);
                runtime.block_on(connection.run(shutdown_rx));
            })?;

        info!(url = %self.config.url, device_id = %self.identity.short_id(), "Gateway client started");
        *worker = Some(Worker {
            commands: commands_tx,
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the worker, failing in-flight requests, and wait for it to exit
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.shutdown.send(true);
        drop(worker.commands);
        if worker.handle.thread().id() == thread::current().id() {
            // Called from a listener callback; the loop exits on its own
            return;
        }
        if worker.handle.join().is_err() {
            warn!("Gateway worker thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Send a chat message to the active session (fire-and-forget)
    pub fn send_message(&self, text: impl Into<String>) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.dispatch(Command::SendChat { text: text.into() })
    }

    /// Abort the run in progress on the active session
    pub fn cancel_current(&self) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.dispatch(Command::Abort)
    }

    pub fn respond_approval(&self, id: impl Into<String>, approved: bool) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.dispatch(Command::RespondApproval {
            id: id.into(),
            approved,
        })
    }

    /// Ask for `runs.list`; the cached list is replaced when the answer arrives
    pub fn refresh_runs(&self) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.dispatch(Command::FetchRuns)
    }

    /// Ask for `cron.list`; the cached list is replaced when the answer arrives
    pub fn refresh_cron(&self) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.dispatch(Command::FetchCron)
    }

    /// Issue a request and block until its response or timeout.
    ///
    /// Must not be called from inside an async runtime or from a listener
    /// callback; use [`request_handle`](Self::request_handle) there.
    pub fn request(&self, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
        self.request_handle(method, params)?.wait()
    }

    /// Issue a request and return a handle to wait on later
    pub fn request_handle(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<ResponseHandle, GatewayError> {
        self.ensure_connected()?;
        let (tx, rx) = oneshot::channel();
        self.dispatch(Command::Request {
            method: method.to_string(),
            params,
            reply: Some(tx),
        })?;
        Ok(ResponseHandle::new(method, rx))
    }

    /// Drop the current stream and reconnect right away
    pub fn force_reconnect(&self) -> Result<(), GatewayError> {
        self.dispatch(Command::Reconnect)
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.shared.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn dispatch(&self, command: Command) -> Result<(), GatewayError> {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = worker.as_ref().ok_or(GatewayError::ChannelClosed)?;
        sender
            .commands
            .send(command)
            .map_err(|_| GatewayError::ChannelClosed)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn status(&self) -> ClientStatus {
        self.shared.lock().status.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.lock().messages.iter().cloned().collect()
    }

    pub fn current_streaming(&self) -> Option<StreamingMessage> {
        self.shared.lock().streaming.clone()
    }

    pub fn session(&self) -> Option<SessionContext> {
        self.shared.lock().session.clone()
    }

    pub fn presence(&self) -> HashMap<String, Value> {
        self.shared.lock().presence.clone()
    }

    pub fn health(&self) -> Option<Value> {
        self.shared.lock().health.clone()
    }

    pub fn gateway_info(&self) -> GatewayInfo {
        self.shared.lock().gateway_info.clone()
    }

    pub fn pending_approvals(&self) -> Vec<Approval> {
        self.shared.lock().approvals.clone()
    }

    pub fn runs(&self) -> Vec<Value> {
        self.shared.lock().runs.clone()
    }

    pub fn cron(&self) -> Vec<Value> {
        self.shared.lock().cron.clone()
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().last_tick
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.config.url)
            .field("device_id", &self.identity.device_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
