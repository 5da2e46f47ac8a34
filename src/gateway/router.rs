use crate::core::types::{ChatMessage, Notification, StreamingMessage};
use crate::gateway::auth::presence_map;
use crate::gateway::events::{
    AgentEvent, AgentStream, ChatEvent, ChatState, GatewayEvent, LifecyclePhase, ShutdownNotice,
    ToolPhase, ToolUpdate,
};
use crate::gateway::state::ClientShared;
use chrono::Utc;
use tracing::{debug, info};

/// Applies server events to shared state and fans them out to the listener.
///
/// Owns the in-progress streaming message; readers see a copy.
#[derive(Debug, Default)]
pub struct EventRouter {
    streaming: Option<StreamingMessage>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streaming(&self) -> Option<&StreamingMessage> {
        self.streaming.as_ref()
    }

    pub fn dispatch(&mut self, event: GatewayEvent, shared: &ClientShared) {
        match event {
            GatewayEvent::Agent(agent) => self.on_agent(agent, shared),
            GatewayEvent::Chat(chat) => self.on_chat(chat, shared),
            GatewayEvent::Tick => shared.lock().last_tick = Some(Utc::now()),
            GatewayEvent::Health(health) => shared.lock().health = Some(health),
            GatewayEvent::Presence(payload) => {
                let devices = payload
                    .get("devices")
                    .or_else(|| payload.get("clients"))
                    .filter(|d| d.is_array())
                    .unwrap_or(&payload);
                shared.lock().presence = presence_map(devices);
            }
            GatewayEvent::ApprovalRequested(approval) => {
                shared.lock().approvals.push(approval.clone());
                shared.emit_approval(&approval);
                shared.notify(Notification::warning(
                    format!("Approval: {}", approval.tool),
                    "Needs approval",
                    10.0,
                ));
            }
            GatewayEvent::Shutdown(ShutdownNotice {
                reason,
                restart_expected_ms,
            }) => {
                let mut message = format!("Shutdown: {}", reason);
                if let Some(ms) = restart_expected_ms.filter(|ms| *ms > 0) {
                    message.push_str(&format!(" (restart in {}s)", ms / 1000));
                }
                shared.notify(Notification::warning("Gateway Shutdown", message, 10.0));
            }
            GatewayEvent::Error(message) => {
                shared.notify(Notification::error("Error", truncate(&message, 50), 5.0));
            }
            GatewayEvent::Cancelled => {
                shared.notify(Notification::warning("Cancelled", "", 2.0));
                self.clear_streaming(shared);
                shared.update_status(|s| s.is_streaming = false);
            }
            GatewayEvent::PairingRequired(_) => {
                shared.notify(Notification::warning(
                    "Pairing Required",
                    "Approve this device on the gateway",
                    10.0,
                ));
            }
            GatewayEvent::Paired(_) => {
                shared.notify(Notification::success("Device Paired", "", 3.0));
            }
            GatewayEvent::ConnectChallenge(_) => {
                debug!("Ignoring connect challenge outside the handshake");
            }
            GatewayEvent::Unknown(name) => debug!(event = %name, "Unknown event"),
        }
    }

    fn on_agent(&mut self, agent: AgentEvent, shared: &ClientShared) {
        let AgentEvent { run_id, stream } = agent;
        match stream {
            AgentStream::Lifecycle(LifecyclePhase::Start) => {
                info!(run_id = %short(&run_id), "Agent run started");
                shared.update_status(|s| {
                    s.is_streaming = true;
                    s.current_task = "Processing...".to_string();
                });
            }
            AgentStream::Lifecycle(LifecyclePhase::End) => {
                info!(run_id = %short(&run_id), "Agent run ended");
                self.clear_streaming(shared);
                shared.update_status(|s| {
                    s.is_streaming = false;
                    s.current_task = "Idle".to_string();
                });
            }
            AgentStream::Lifecycle(LifecyclePhase::Error(message)) => {
                info!(run_id = %short(&run_id), "Agent run error: {}", message);
                self.clear_streaming(shared);
                shared.update_status(|s| {
                    s.is_streaming = false;
                    s.current_task = "Error".to_string();
                });
                shared.notify(Notification::error("Agent Error", truncate(&message, 80), 5.0));
            }
            AgentStream::Lifecycle(LifecyclePhase::Other(phase)) => {
                debug!(run_id = %short(&run_id), phase = %phase, "Unhandled lifecycle phase");
            }
            AgentStream::Assistant { delta } => {
                if delta.is_empty() {
                    return;
                }
                self.append_delta(&run_id, &delta, shared);
                shared.emit_chunk(&run_id, &delta);
            }
            AgentStream::Tool(ToolUpdate { name, phase }) => match phase {
                ToolPhase::Start => {
                    shared.notify(Notification::info(
                        format!("Tool: {}", name),
                        "Running...",
                        10.0,
                    ));
                    shared.update_status(|s| s.current_task = format!("Running: {}", name));
                }
                ToolPhase::End => {
                    shared.notify(Notification::success(format!("Tool: {}", name), "Done", 1.0));
                }
                ToolPhase::Error => {
                    shared.notify(Notification::error(format!("Tool: {}", name), "Failed", 5.0));
                }
                ToolPhase::Other(phase) => debug!(tool = %name, phase = %phase, "Tool update"),
            },
            AgentStream::Other(_) => {}
        }
    }

    fn append_delta(&mut self, run_id: &str, delta: &str, shared: &ClientShared) {
        let starts_new = self.streaming.as_ref().map_or(true, |m| m.id != run_id);
        if starts_new {
            self.streaming = Some(StreamingMessage::new(run_id, "assistant"));
        }
        let snapshot = self.streaming.as_mut().map(|message| {
            message.append_chunk(delta);
            message.clone()
        });

        let mut state = shared.lock();
        state.streaming = snapshot;
        state.status.is_streaming = true;
    }

    fn on_chat(&mut self, chat: ChatEvent, shared: &ClientShared) {
        match chat.state {
            ChatState::Final => {
                let streamed = self
                    .streaming
                    .take()
                    .filter(|m| m.id == chat.run_id)
                    .map(|m| m.content);
                let text = if chat.text.is_empty() {
                    streamed.unwrap_or_default()
                } else {
                    chat.text
                };
                let message = ChatMessage::new(chat.role, text);
                info!(
                    run_id = %short(&chat.run_id),
                    chars = message.content.len(),
                    "Message complete"
                );

                {
                    let mut state = shared.lock();
                    state.streaming = None;
                    state.push_message(message.clone());
                }
                shared.update_status(|s| {
                    s.is_streaming = false;
                    if let Some(usage) = chat.usage {
                        s.tokens_in += usage.input;
                        s.tokens_out += usage.output;
                        s.cost += usage.cost;
                    }
                });
                shared.emit_complete(&message);
            }
            ChatState::Delta => {}
            ChatState::Error(message) => {
                self.clear_streaming(shared);
                shared.update_status(|s| s.is_streaming = false);
                shared.notify(Notification::error("Chat Error", truncate(&message, 80), 5.0));
            }
            ChatState::Aborted => {
                self.clear_streaming(shared);
                shared.update_status(|s| s.is_streaming = false);
                shared.notify(Notification::warning("Aborted", "Run was aborted", 2.0));
            }
            ChatState::Other(state) => debug!(state = %state, "Unhandled chat state"),
        }
    }

    fn clear_streaming(&mut self, shared: &ClientShared) {
        self.streaming = None;
        shared.lock().streaming = None;
    }

    /// Forget the in-progress message, e.g. after the stream dropped
    pub fn reset(&mut self, shared: &ClientShared) {
        self.clear_streaming(shared);
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
