use crate::core::traits::GatewayListener;
use crate::core::types::{
    Approval, ChatMessage, ClientStatus, ConnectionState, GatewayInfo, Notification,
    NotificationKind, SessionContext, StreamingMessage,
};
use crate::gateway::pending::PendingRequests;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// Everything readable from caller threads
#[derive(Debug)]
pub struct SharedState {
    pub state: ConnectionState,
    pub status: ClientStatus,
    pub messages: VecDeque<ChatMessage>,
    /// Copy of the loop's in-progress message
    pub streaming: Option<StreamingMessage>,
    pub session: Option<SessionContext>,
    pub pending: PendingRequests,
    pub presence: HashMap<String, Value>,
    pub health: Option<Value>,
    pub gateway_info: GatewayInfo,
    pub approvals: Vec<Approval>,
    pub runs: Vec<Value>,
    pub cron: Vec<Value>,
    pub last_tick: Option<DateTime<Utc>>,
    max_messages: usize,
}

impl SharedState {
    fn new(max_messages: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            status: ClientStatus::default(),
            messages: VecDeque::with_capacity(max_messages.min(1024)),
            streaming: None,
            session: None,
            pending: PendingRequests::new(),
            presence: HashMap::new(),
            health: None,
            gateway_info: GatewayInfo::default(),
            approvals: Vec::new(),
            runs: Vec::new(),
            cron: Vec::new(),
            last_tick: None,
            max_messages,
        }
    }

    /// Append to the message log, dropping the oldest entries past capacity
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }
}

/// State shared between the protocol loop and caller threads, plus the
/// listener that gets told about changes.
///
/// Listener callbacks are always made after the lock is released.
pub struct ClientShared {
    inner: Mutex<SharedState>,
    listener: Arc<dyn GatewayListener>,
}

impl ClientShared {
    pub fn new(max_messages: usize, listener: Arc<dyn GatewayListener>) -> Self {
        Self {
            inner: Mutex::new(SharedState::new(max_messages)),
            listener,
        }
    }

    /// A panicking listener must not wedge every other thread, so poisoning is ignored
    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Transition and report; no-op when already in `state`
    pub fn set_state(&self, state: ConnectionState) -> bool {
        let previous = {
            let mut guard = self.lock();
            std::mem::replace(&mut guard.state, state)
        };
        if previous == state {
            return false;
        }
        info!(from = %previous, to = %state, "Connection state changed");
        self.guarded("on_connection_change", |l| l.on_connection_change(state));
        true
    }

    pub fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Error | NotificationKind::Warning => {
                warn!(title = %notification.title, "{}", notification.message)
            }
            NotificationKind::Info | NotificationKind::Success => {
                info!(title = %notification.title, "{}", notification.message)
            }
        }
        self.guarded("on_notification", |l| l.on_notification(&notification));
    }

    /// Mutate the status under the lock, then report the new value
    pub fn update_status(&self, f: impl FnOnce(&mut ClientStatus)) {
        let status = {
            let mut guard = self.lock();
            f(&mut guard.status);
            guard.status.clone()
        };
        self.guarded("on_status_change", |l| l.on_status_change(&status));
    }

    pub fn emit_chunk(&self, run_id: &str, text: &str) {
        self.guarded("on_message_chunk", |l| l.on_message_chunk(run_id, text));
    }

    pub fn emit_complete(&self, message: &ChatMessage) {
        self.guarded("on_message_complete", |l| l.on_message_complete(message));
    }

    pub fn emit_approval(&self, approval: &Approval) {
        self.guarded("on_approval_requested", |l| l.on_approval_requested(approval));
    }

    fn guarded(&self, callback: &str, f: impl FnOnce(&dyn GatewayListener)) {
        let listener = self.listener.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
            error!(callback, "Listener panicked; continuing");
        }
    }
}

impl std::fmt::Debug for ClientShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientShared").finish_non_exhaustive()
    }
}
