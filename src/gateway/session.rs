use crate::core::types::{ChatMessage, SessionContext};
use crate::gateway::events::extract_text;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One entry of a `sessions.list` response. Everything but `key` may be
/// missing or `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionInfo {
    pub key: String,
    pub session_id: Option<String>,
    pub kind: Option<String>,
    pub display_name: Option<String>,
    pub model: Option<String>,
}

impl SessionInfo {
    fn is_direct(&self) -> bool {
        self.kind.as_deref() == Some("direct")
    }

    fn is_heartbeat(&self) -> bool {
        self.display_name
            .as_deref()
            .unwrap_or_default()
            .contains("heartbeat")
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_key: self.key.clone(),
            session_id: self.session_id.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Sessions from a `sessions.list` payload; malformed entries are skipped
pub fn parse_sessions(payload: &Value) -> Vec<SessionInfo> {
    payload
        .get("sessions")
        .and_then(Value::as_array)
        .map(|sessions| {
            sessions
                .iter()
                .filter_map(|s| match SessionInfo::deserialize(s) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        debug!("Skipping malformed session entry: {}", e);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Prefer a direct session that is not the heartbeat one, then any direct
/// session, then whatever comes first.
pub fn select_session(sessions: &[SessionInfo]) -> Option<&SessionInfo> {
    sessions
        .iter()
        .find(|s| s.is_direct() && !s.is_heartbeat())
        .or_else(|| sessions.iter().find(|s| s.is_direct()))
        .or_else(|| sessions.first())
}

/// The last `limit` usable entries of a `chat.history` payload
pub fn parse_history(payload: &Value, limit: usize) -> Vec<ChatMessage> {
    let entries = match payload {
        Value::Array(entries) => entries.as_slice(),
        _ => payload
            .get("messages")
            .or_else(|| payload.get("history"))
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice),
    };

    let usable: Vec<ChatMessage> = entries
        .iter()
        .filter_map(|entry| {
            let role = entry.get("role").and_then(Value::as_str)?;
            let text = entry.get("content").map(extract_text)?;
            (!role.is_empty() && !text.is_empty()).then(|| ChatMessage::new(role, text))
        })
        .collect();

    let skip = usable.len().saturating_sub(limit);
    usable.into_iter().skip(skip).collect()
}
