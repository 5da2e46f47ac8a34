use crate::core::errors::GatewayError;
use crate::core::kernel::WsCodec;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// One self-contained protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Either `{code, message, ...}` or a bare string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseFrame {
    pub fn error_code(&self) -> Option<&str> {
        self.error
            .as_ref()
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(e) => e
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| e.to_string(), ToString::to_string),
            None => "Unknown error".to_string(),
        }
    }

    /// `ok:true` yields the payload (null when absent), `ok:false` a `RequestFailed`
    pub fn into_result(self, method: &str) -> Result<Value, GatewayError> {
        if self.ok {
            Ok(self.payload.unwrap_or(Value::Null))
        } else {
            Err(GatewayError::RequestFailed {
                method: method.to_string(),
                code: self.error_code().unwrap_or("UNKNOWN").to_string(),
                message: self.error_message(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(
        default,
        rename = "stateVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<Value>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: None,
            state_version: None,
        }
    }
}

// Ids are strings on the wire, but tolerate peers that echo them as numbers
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// JSON text codec for gateway frames
#[derive(Debug, Default, Clone, Copy)]
pub struct GatewayCodec;

impl GatewayCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decode one frame from JSON text
    ///
    /// Frames with an unrecognized `type` are skipped (`Ok(None)`).
    pub fn decode_text(&self, text: &str) -> Result<Option<Frame>, GatewayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::DecodeError(format!("invalid JSON: {}", e)))?;

        match value.get("type").and_then(Value::as_str) {
            Some("req" | "res" | "event") => serde_json::from_value::<Frame>(value)
                .map(Some)
                .map_err(|e| GatewayError::DecodeError(format!("malformed frame: {}", e))),
            Some(other) => {
                debug!(frame_type = other, "Ignoring frame with unknown type");
                Ok(None)
            }
            None => Err(GatewayError::DecodeError(
                "frame has no type field".to_string(),
            )),
        }
    }
}

impl WsCodec for GatewayCodec {
    type Message = Frame;
    type Outbound = Frame;

    fn encode_message(&self, frame: &Frame) -> Result<Message, GatewayError> {
        Ok(Message::Text(serde_json::to_string(frame)?))
    }

    fn decode_message(&self, message: Message) -> Result<Option<Frame>, GatewayError> {
        match message {
            Message::Text(text) => self.decode_text(&text),
            Message::Binary(data) => {
                let text = String::from_utf8(data).map_err(|e| {
                    GatewayError::DecodeError(format!("binary frame is not UTF-8: {}", e))
                })?;
                self.decode_text(&text)
            }
            _ => Ok(None),
        }
    }
}
