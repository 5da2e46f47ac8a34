use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:18789";
pub const DEFAULT_KEY_FILE: &str = ".clawlink_device_keys.json";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<Secret<String>>,
    pub key_path: PathBuf,
    pub client_id: String,
    pub client_mode: String,
    pub client_version: String,
    pub platform: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub setup_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How many trailing history entries are loaded after selecting a session
    pub history_limit: usize,
    /// Capacity of the in-memory message log
    pub max_messages: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: None,
            key_path: default_key_path(),
            client_id: "cli".to_string(),
            client_mode: "cli".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: env::consts::OS.to_string(),
            role: "operator".to_string(),
            scopes: vec![
                "operator.read".to_string(),
                "operator.write".to_string(),
                "operator.admin".to_string(),
            ],
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            setup_timeout_ms: 5_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            history_limit: 10,
            max_messages: 100,
        }
    }
}

// Custom Serialize implementation - never expose the bearer token
impl Serialize for GatewayConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("GatewayConfig", 18)?;
        state.serialize_field("url", &self.url)?;
        state.serialize_field("token", &self.token.as_ref().map(|_| "[REDACTED]"))?;
        state.serialize_field("key_path", &self.key_path)?;
        state.serialize_field("client_id", &self.client_id)?;
        state.serialize_field("client_mode", &self.client_mode)?;
        state.serialize_field("client_version", &self.client_version)?;
        state.serialize_field("platform", &self.platform)?;
        state.serialize_field("role", &self.role)?;
        state.serialize_field("scopes", &self.scopes)?;
        state.serialize_field("connect_timeout_ms", &self.connect_timeout_ms)?;
        state.serialize_field("handshake_timeout_ms", &self.handshake_timeout_ms)?;
        state.serialize_field("request_timeout_ms", &self.request_timeout_ms)?;
        state.serialize_field("setup_timeout_ms", &self.setup_timeout_ms)?;
        state.serialize_field("reconnect_base_delay_ms", &self.reconnect_base_delay_ms)?;
        state.serialize_field("reconnect_max_delay_ms", &self.reconnect_max_delay_ms)?;
        state.serialize_field("heartbeat_interval_ms", &self.heartbeat_interval_ms)?;
        state.serialize_field("history_limit", &self.history_limit)?;
        state.serialize_field("max_messages", &self.max_messages)?;
        state.end()
    }
}

// Custom Deserialize implementation - missing fields fall back to defaults
impl<'de> Deserialize<'de> for GatewayConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(default)]
        struct GatewayConfigHelper {
            url: String,
            token: Option<String>,
            key_path: PathBuf,
            client_id: String,
            client_mode: String,
            role: String,
            scopes: Vec<String>,
            connect_timeout_ms: u64,
            handshake_timeout_ms: u64,
            request_timeout_ms: u64,
            setup_timeout_ms: u64,
            reconnect_base_delay_ms: u64,
            reconnect_max_delay_ms: u64,
            heartbeat_interval_ms: u64,
            history_limit: usize,
            max_messages: usize,
        }

        impl Default for GatewayConfigHelper {
            fn default() -> Self {
                let d = GatewayConfig::default();
                Self {
                    url: d.url,
                    token: None,
                    key_path: d.key_path,
                    client_id: d.client_id,
                    client_mode: d.client_mode,
                    role: d.role,
                    scopes: d.scopes,
                    connect_timeout_ms: d.connect_timeout_ms,
                    handshake_timeout_ms: d.handshake_timeout_ms,
                    request_timeout_ms: d.request_timeout_ms,
                    setup_timeout_ms: d.setup_timeout_ms,
                    reconnect_base_delay_ms: d.reconnect_base_delay_ms,
                    reconnect_max_delay_ms: d.reconnect_max_delay_ms,
                    heartbeat_interval_ms: d.heartbeat_interval_ms,
                    history_limit: d.history_limit,
                    max_messages: d.max_messages,
                }
            }
        }

        let helper = GatewayConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            url: helper.url,
            token: helper.token.filter(|t| !t.is_empty()).map(Secret::new),
            key_path: helper.key_path,
            client_id: helper.client_id,
            client_mode: helper.client_mode,
            role: helper.role,
            scopes: helper.scopes,
            connect_timeout_ms: helper.connect_timeout_ms,
            handshake_timeout_ms: helper.handshake_timeout_ms,
            request_timeout_ms: helper.request_timeout_ms,
            setup_timeout_ms: helper.setup_timeout_ms,
            reconnect_base_delay_ms: helper.reconnect_base_delay_ms,
            reconnect_max_delay_ms: helper.reconnect_max_delay_ms,
            heartbeat_interval_ms: helper.heartbeat_interval_ms,
            history_limit: helper.history_limit,
            max_messages: helper.max_messages,
            ..Self::default()
        })
    }
}

impl GatewayConfig {
    /// Create a configuration for the given gateway URL with default settings
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - `{PREFIX}_URL` (defaults to `ws://localhost:18789`)
    /// - `{PREFIX}_TOKEN` bearer token sent during the handshake
    /// - `{PREFIX}_KEY_PATH` location of the device key file
    /// - `{PREFIX}_CLIENT_ID`, `{PREFIX}_CLIENT_MODE`, `{PREFIX}_ROLE`
    /// - `{PREFIX}_SCOPES` comma separated
    /// - `{PREFIX}_REQUEST_TIMEOUT_MS`, `{PREFIX}_RECONNECT_BASE_MS`, `{PREFIX}_RECONNECT_MAX_MS`
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let var = |name: &str| env::var(format!("{}_{}", prefix, name)).ok();
        let mut config = Self::default();

        if let Some(url) = var("URL") {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "{}_URL must be a ws:// or wss:// URL, got '{}'",
                    prefix, url
                )));
            }
            config.url = url;
        }
        if let Some(token) = var("TOKEN").filter(|t| !t.is_empty()) {
            config.token = Some(Secret::new(token));
        }
        if let Some(path) = var("KEY_PATH") {
            config.key_path = PathBuf::from(path);
        }
        if let Some(client_id) = var("CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(client_mode) = var("CLIENT_MODE") {
            config.client_mode = client_mode;
        }
        if let Some(role) = var("ROLE") {
            config.role = role;
        }
        if let Some(scopes) = var("SCOPES") {
            config.scopes = scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(ms) = var("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse_millis(&prefix, "REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = var("RECONNECT_BASE_MS") {
            config.reconnect_base_delay_ms = parse_millis(&prefix, "RECONNECT_BASE_MS", &ms)?;
        }
        if let Some(ms) = var("RECONNECT_MAX_MS") {
            config.reconnect_max_delay_ms = parse_millis(&prefix, "RECONNECT_MAX_MS", &ms)?;
        }

        Ok(config)
    }

    /// Create configuration from .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // .env file doesn't exist, continue with system env vars
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Load configuration with automatic .env file detection
    ///
    /// Tries `.env.local`, then `.env.{ENVIRONMENT}`, then `.env`; the first file found wins.
    #[cfg(feature = "env-file")]
    pub fn from_env_auto(prefix: &str) -> Result<Self, ConfigError> {
        let env_files = [
            ".env.local".to_string(),
            format!(
                ".env.{}",
                env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
            ),
            ".env".to_string(),
        ];

        for env_file in &env_files {
            match dotenv::from_path(env_file) {
                Ok(_) => break,
                Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ConfigError::InvalidConfiguration(format!(
                        "Failed to load .env file '{}': {}",
                        env_file, e
                    )));
                }
            }
        }

        Self::from_env(prefix)
    }

    /// Set the bearer token presented during the handshake
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() {
            None
        } else {
            Some(Secret::new(token))
        };
        self
    }

    /// Set the device key file location
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = path.into();
        self
    }

    /// Set the reconnect backoff bounds
    #[must_use]
    pub const fn with_reconnect_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.reconnect_base_delay_ms = base_ms;
        self.reconnect_max_delay_ms = max_ms;
        self
    }

    /// Set the timeout applied to blocking-style requests
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Set the handshake and post-connect setup timeouts
    #[must_use]
    pub const fn with_handshake_timeouts(mut self, handshake_ms: u64, setup_ms: u64) -> Self {
        self.handshake_timeout_ms = handshake_ms;
        self.setup_timeout_ms = setup_ms;
        self
    }

    /// Bearer token, empty when none is configured (use carefully - exposes secret)
    pub fn token(&self) -> &str {
        self.token.as_ref().map_or("", |t| t.expose_secret().as_str())
    }

    pub fn has_token(&self) -> bool {
        !self.token().is_empty()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_key_path() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_KEY_FILE)
}

fn parse_millis(prefix: &str, name: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|e| {
        ConfigError::InvalidConfiguration(format!("{}_{} is not a number: {}", prefix, name, e))
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
