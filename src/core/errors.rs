use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Device pairing required: {0}")]
    PairingRequired(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Frame decode error: {0}")]
    DecodeError(String),

    #[error("Request {method} failed: {code} - {message}")]
    RequestFailed {
        method: String,
        code: String,
        message: String,
    },

    #[error("Request {method} timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    #[error("Not connected to gateway")]
    NotConnected,

    #[error("Client loop is not running")]
    ChannelClosed,
}

impl GatewayError {
    /// Errors that mean the stream is unusable and a reconnect is due.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::ConnectionTimeout(_)
                | Self::Io(_)
                | Self::HandshakeFailed(_)
                | Self::PairingRequired(_)
                | Self::ConnectionLost
        )
    }

    /// Errors that no amount of retrying will fix; the client moves to `failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidEndpoint(_))
    }
}
