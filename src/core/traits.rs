use crate::core::types::{Approval, ChatMessage, ClientStatus, ConnectionState, Notification};
use tokio::sync::mpsc;

/// Callback contract exposed to the surrounding system.
///
/// Every method runs on the protocol loop thread, so implementations should
/// hand work off quickly. All methods default to doing nothing.
pub trait GatewayListener: Send + Sync {
    /// A streamed text delta for `run_id`
    fn on_message_chunk(&self, _run_id: &str, _text: &str) {}

    /// A message finished and was appended to the log
    fn on_message_complete(&self, _message: &ChatMessage) {}

    fn on_notification(&self, _notification: &Notification) {}

    fn on_status_change(&self, _status: &ClientStatus) {}

    fn on_connection_change(&self, _state: ConnectionState) {}

    fn on_approval_requested(&self, _approval: &Approval) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl GatewayListener for NoopListener {}

/// Callbacks as values, for consumers that prefer a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    MessageChunk { run_id: String, text: String },
    MessageComplete(ChatMessage),
    Notification(Notification),
    StatusChanged(ClientStatus),
    ConnectionChanged(ConnectionState),
    ApprovalRequested(Approval),
}

impl GatewayListener for mpsc::UnboundedSender<ClientEvent> {
    fn on_message_chunk(&self, run_id: &str, text: &str) {
        let _ = self.send(ClientEvent::MessageChunk {
            run_id: run_id.to_string(),
            text: text.to_string(),
        });
    }

    fn on_message_complete(&self, message: &ChatMessage) {
        let _ = self.send(ClientEvent::MessageComplete(message.clone()));
    }

    fn on_notification(&self, notification: &Notification) {
        let _ = self.send(ClientEvent::Notification(notification.clone()));
    }

    fn on_status_change(&self, status: &ClientStatus) {
        let _ = self.send(ClientEvent::StatusChanged(status.clone()));
    }

    fn on_connection_change(&self, state: ConnectionState) {
        let _ = self.send(ClientEvent::ConnectionChanged(state));
    }

    fn on_approval_requested(&self, approval: &Approval) {
        let _ = self.send(ClientEvent::ApprovalRequested(approval.clone()));
    }
}
