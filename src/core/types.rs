use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the gateway connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the client is explicitly restarted
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// Something worth surfacing to a human. Not persisted, not acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// How long a UI should keep it on screen
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            duration,
            timestamp: Utc::now(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>, secs: f64) -> Self {
        Self::new(NotificationKind::Info, title, message, Duration::from_secs_f64(secs))
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>, secs: f64) -> Self {
        Self::new(
            NotificationKind::Success,
            title,
            message,
            Duration::from_secs_f64(secs),
        )
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>, secs: f64) -> Self {
        Self::new(
            NotificationKind::Warning,
            title,
            message,
            Duration::from_secs_f64(secs),
        )
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>, secs: f64) -> Self {
        Self::new(NotificationKind::Error, title, message, Duration::from_secs_f64(secs))
    }
}

/// A completed conversation entry in the message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The assistant reply currently being streamed for a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamingMessage {
    /// Run id the deltas belong to
    pub id: String,
    pub role: String,
    pub content: String,
    pub complete: bool,
    pub started_at: DateTime<Utc>,
}

impl StreamingMessage {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            content: String::new(),
            complete: false,
            started_at: Utc::now(),
        }
    }

    pub fn append_chunk(&mut self, chunk: &str) {
        self.content.push_str(chunk);
    }
}

/// Server-side conversation context selected after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    pub session_key: String,
    pub session_id: String,
    pub model: String,
}

/// Aggregate status shown by UIs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub current_task: String,
    pub is_streaming: bool,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            model: "unknown".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            current_task: "Idle".to_string(),
            is_streaming: false,
        }
    }
}

/// A tool execution waiting for a human decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Approval {
    pub id: String,
    pub tool: String,
    pub args: Value,
    pub description: String,
    pub run_id: String,
    pub requested_at: DateTime<Utc>,
}

/// Gateway snapshot delivered with a successful connect response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub uptime_ms: Option<u64>,
    /// Per-domain version counters, e.g. `{"presence": 3, "health": 7}`
    pub state_version: Option<Value>,
    pub ts: Option<i64>,
}
