use crate::core::config::GatewayConfig;
use crate::core::errors::GatewayError;
use crate::core::types::GatewayInfo;
use crate::gateway::codec::ResponseFrame;
use crate::gateway::identity::DeviceIdentity;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

pub const PROTOCOL_VERSION: u32 = 3;
const SIGNATURE_VERSION: &str = "v2";

/// Fields covered by the device signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    pub device_id: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub signed_at: i64,
    pub token: String,
    pub nonce: String,
}

impl AuthPayload {
    /// `v2|deviceId|clientId|clientMode|role|scopes|signedAt|token|nonce`
    pub fn to_signing_string(&self) -> String {
        [
            SIGNATURE_VERSION,
            &self.device_id,
            &self.client_id,
            &self.client_mode,
            &self.role,
            &self.scopes.join(","),
            &self.signed_at.to_string(),
            &self.token,
            &self.nonce,
        ]
        .join("|")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub device: DeviceProof,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<TokenAuth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProof {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    pub nonce: String,
}

#[derive(Clone, Serialize)]
pub struct TokenAuth {
    pub token: String,
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenAuth([REDACTED])")
    }
}

impl ConnectParams {
    /// Build and sign the `connect` request params for a challenge nonce
    pub fn signed(
        config: &GatewayConfig,
        identity: &DeviceIdentity,
        nonce: &str,
        signed_at: i64,
    ) -> Self {
        let payload = AuthPayload {
            device_id: identity.device_id().to_string(),
            client_id: config.client_id.clone(),
            client_mode: config.client_mode.clone(),
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            signed_at,
            token: config.token().to_string(),
            nonce: nonce.to_string(),
        };
        let signature = identity.sign(&payload.to_signing_string());

        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: config.client_id.clone(),
                version: config.client_version.clone(),
                platform: config.platform.clone(),
                mode: config.client_mode.clone(),
            },
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            device: DeviceProof {
                id: payload.device_id,
                public_key: identity.public_key_base64(),
                signature,
                signed_at,
                nonce: payload.nonce,
            },
            auth: config.has_token().then(|| TokenAuth {
                token: config.token().to_string(),
            }),
        }
    }

    pub fn to_value(&self) -> Result<Value, GatewayError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// State snapshot returned with a successful `connect`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelloSnapshot {
    pub gateway_info: GatewayInfo,
    pub presence: HashMap<String, Value>,
    pub health: Option<Value>,
    pub session_id: Option<String>,
}

impl HelloSnapshot {
    pub fn from_payload(payload: &Value) -> Self {
        let snapshot = payload.get("snapshot").unwrap_or(payload);
        Self {
            gateway_info: GatewayInfo {
                uptime_ms: snapshot.get("uptimeMs").and_then(Value::as_u64),
                state_version: snapshot.get("stateVersion").cloned(),
                ts: snapshot
                    .get("ts")
                    .or_else(|| payload.get("ts"))
                    .and_then(Value::as_i64),
            },
            presence: snapshot
                .get("presence")
                .map(presence_map)
                .unwrap_or_default(),
            health: snapshot.get("health").cloned(),
            session_id: payload
                .get("sessionId")
                .or_else(|| snapshot.get("sessionId"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }
    }
}

/// Presence list keyed by `deviceId`, then `id`, then position; objects pass through
pub fn presence_map(presence: &Value) -> HashMap<String, Value> {
    match presence {
        Value::Array(entries) => entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let key = entry
                    .get("deviceId")
                    .or_else(|| entry.get("id"))
                    .and_then(Value::as_str)
                    .map_or_else(|| i.to_string(), ToString::to_string);
                (key, entry.clone())
            })
            .collect(),
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    }
}

/// Map a rejected `connect` response to a handshake error
pub fn connect_rejection(response: &ResponseFrame) -> GatewayError {
    let message = response.error_message();
    let code = response.error_code().unwrap_or("");
    let lowered = message.to_lowercase();

    if matches!(code, "NOT_PAIRED" | "PAIRING_REQUIRED")
        || lowered.contains("pairing")
        || lowered.contains("approval")
    {
        GatewayError::PairingRequired(message)
    } else if code.is_empty() {
        GatewayError::HandshakeFailed(message)
    } else {
        GatewayError::HandshakeFailed(format!("{}: {}", code, message))
    }
}
