use crate::core::types::Approval;
use crate::gateway::codec::EventFrame;
use chrono::Utc;
use serde_json::Value;

pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_AGENT: &str = "agent";
pub const EVENT_CHAT: &str = "chat";
pub const EVENT_TICK: &str = "tick";
pub const EVENT_HEALTH: &str = "health";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_APPROVAL_REQUESTED: &str = "exec.approval.requested";
pub const EVENT_SHUTDOWN: &str = "shutdown";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_CANCELLED: &str = "cancelled";
pub const EVENT_PAIRING_REQUIRED: &str = "device.pairing.required";
pub const EVENT_PAIRED: &str = "device.paired";

/// Server-pushed event, one variant per category
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    ConnectChallenge(Challenge),
    Agent(AgentEvent),
    Chat(ChatEvent),
    Tick,
    Health(Value),
    Presence(Value),
    ApprovalRequested(Approval),
    Shutdown(ShutdownNotice),
    Error(String),
    Cancelled,
    PairingRequired(Value),
    Paired(Value),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub nonce: String,
    pub ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub run_id: String,
    pub stream: AgentStream,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentStream {
    Lifecycle(LifecyclePhase),
    Assistant { delta: String },
    Tool(ToolUpdate),
    /// Streams such as "thinking" that nothing consumes
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecyclePhase {
    Start,
    End,
    Error(String),
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUpdate {
    pub name: String,
    pub phase: ToolPhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPhase {
    Start,
    End,
    Error,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub run_id: String,
    pub state: ChatState,
    pub role: String,
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatState {
    Delta,
    Final,
    Error(String),
    Aborted,
    Other(String),
}

/// Token and cost counters reported with a finished message
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotice {
    pub reason: String,
    pub restart_expected_ms: Option<u64>,
}

impl GatewayEvent {
    pub fn from_frame(frame: &EventFrame) -> Self {
        let payload = &frame.payload;
        match frame.event.as_str() {
            EVENT_CONNECT_CHALLENGE => Self::ConnectChallenge(Challenge {
                nonce: str_field(payload, &["nonce"]).unwrap_or_default(),
                ts: payload.get("ts").and_then(Value::as_u64),
            }),
            EVENT_AGENT => Self::Agent(parse_agent(payload)),
            EVENT_CHAT => Self::Chat(parse_chat(payload)),
            EVENT_TICK => Self::Tick,
            EVENT_HEALTH => Self::Health(payload.clone()),
            EVENT_PRESENCE => Self::Presence(payload.clone()),
            EVENT_APPROVAL_REQUESTED => Self::ApprovalRequested(parse_approval(payload)),
            EVENT_SHUTDOWN => Self::Shutdown(ShutdownNotice {
                reason: str_field(payload, &["reason"]).unwrap_or_else(|| "unknown".to_string()),
                restart_expected_ms: payload.get("restartExpectedMs").and_then(Value::as_u64),
            }),
            EVENT_ERROR => Self::Error(
                message_of(payload, &["message", "error"])
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            EVENT_CANCELLED | "cancel" => Self::Cancelled,
            EVENT_PAIRING_REQUIRED => Self::PairingRequired(payload.clone()),
            EVENT_PAIRED => Self::Paired(payload.clone()),
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ConnectChallenge(_) => EVENT_CONNECT_CHALLENGE,
            Self::Agent(_) => EVENT_AGENT,
            Self::Chat(_) => EVENT_CHAT,
            Self::Tick => EVENT_TICK,
            Self::Health(_) => EVENT_HEALTH,
            Self::Presence(_) => EVENT_PRESENCE,
            Self::ApprovalRequested(_) => EVENT_APPROVAL_REQUESTED,
            Self::Shutdown(_) => EVENT_SHUTDOWN,
            Self::Error(_) => EVENT_ERROR,
            Self::Cancelled => EVENT_CANCELLED,
            Self::PairingRequired(_) => EVENT_PAIRING_REQUIRED,
            Self::Paired(_) => EVENT_PAIRED,
            Self::Unknown(name) => name,
        }
    }
}

fn parse_agent(payload: &Value) -> AgentEvent {
    let run_id = str_field(payload, &["runId"]).unwrap_or_else(|| "unknown".to_string());
    let data = payload.get("data").unwrap_or(&Value::Null);
    let stream = match payload.get("stream").and_then(Value::as_str).unwrap_or("") {
        "lifecycle" => AgentStream::Lifecycle(
            match data.get("phase").and_then(Value::as_str).unwrap_or("") {
                "start" => LifecyclePhase::Start,
                "end" => LifecyclePhase::End,
                "error" => LifecyclePhase::Error(
                    message_of(data, &["error", "message"])
                        .unwrap_or_else(|| "Agent error".to_string()),
                ),
                other => LifecyclePhase::Other(other.to_string()),
            },
        ),
        "assistant" => AgentStream::Assistant {
            delta: str_field(data, &["delta"]).unwrap_or_default(),
        },
        "tool" => AgentStream::Tool(parse_tool(data)),
        other => AgentStream::Other(other.to_string()),
    };
    AgentEvent { run_id, stream }
}

fn parse_tool(data: &Value) -> ToolUpdate {
    let name = str_field(data, &["tool", "name"]).unwrap_or_else(|| "tool".to_string());
    let status = str_field(data, &["status"]).unwrap_or_default();
    let phase = str_field(data, &["phase"]).unwrap_or_default();

    let phase = if status == "start" || phase.contains("start") {
        ToolPhase::Start
    } else if matches!(status.as_str(), "end" | "done" | "complete")
        || matches!(phase.as_str(), "end" | "result")
    {
        ToolPhase::End
    } else if matches!(status.as_str(), "error" | "failed") || phase == "error" {
        ToolPhase::Error
    } else if status.is_empty() {
        ToolPhase::Other(phase)
    } else {
        ToolPhase::Other(status)
    };

    ToolUpdate { name, phase }
}

fn parse_chat(payload: &Value) -> ChatEvent {
    let message = payload.get("message").unwrap_or(&Value::Null);
    let state = match payload.get("state").and_then(Value::as_str).unwrap_or("") {
        "delta" => ChatState::Delta,
        "final" => ChatState::Final,
        "error" => ChatState::Error(
            message_of(payload, &["errorMessage", "error"])
                .unwrap_or_else(|| "Chat error".to_string()),
        ),
        "aborted" => ChatState::Aborted,
        other => ChatState::Other(other.to_string()),
    };

    ChatEvent {
        run_id: str_field(payload, &["runId"]).unwrap_or_else(|| "unknown".to_string()),
        state,
        role: str_field(message, &["role"]).unwrap_or_else(|| "assistant".to_string()),
        text: message.get("content").map(extract_text).unwrap_or_default(),
        usage: message
            .get("usage")
            .or_else(|| payload.get("usage"))
            .and_then(parse_usage),
    }
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    let input = u64_field(usage, &["input", "inputTokens", "input_tokens"]);
    let output = u64_field(usage, &["output", "outputTokens", "output_tokens"]);
    let cost = match usage.get("cost") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(obj @ Value::Object(_)) => obj.get("total").and_then(Value::as_f64),
        _ => None,
    };

    if input.is_none() && output.is_none() && cost.is_none() {
        return None;
    }
    Some(Usage {
        input: input.unwrap_or(0),
        output: output.unwrap_or(0),
        cost: cost.unwrap_or(0.0),
    })
}

fn parse_approval(payload: &Value) -> Approval {
    Approval {
        id: str_field(payload, &["id", "approvalId"]).unwrap_or_default(),
        tool: str_field(payload, &["tool", "name"]).unwrap_or_else(|| "unknown".to_string()),
        args: payload
            .get("args")
            .or_else(|| payload.get("input"))
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        description: str_field(payload, &["description"]).unwrap_or_default(),
        run_id: str_field(payload, &["runId"]).unwrap_or_default(),
        requested_at: Utc::now(),
    }
}

/// Plain text of a message `content`: either a string or an array of blocks,
/// where `{type: "text", text}` blocks and bare strings are joined by newlines.
pub fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) if block.get("type").and_then(Value::as_str) == Some("text") => {
                    Some(block.get("text").and_then(Value::as_str).unwrap_or(""))
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(ToString::to_string)
}

fn u64_field(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_u64))
}

// A string field, or the `message` of an object field
fn message_of(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map_or_else(|| Value::Object(obj.clone()).to_string(), ToString::to_string),
        ),
        _ => None,
    })
}
