use crate::core::errors::GatewayError;
use crate::core::kernel::codec::WsCodec;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::protocol::Message};
use tracing::{debug, instrument, warn};

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000, // 10 seconds
        }
    }
}

/// WebSocket session trait - pure transport layer
#[async_trait]
pub trait WsSession<C: WsCodec>: Send {
    /// Connect to the WebSocket, replacing any previous stream
    async fn connect(&mut self) -> Result<(), GatewayError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), GatewayError>;

    /// Receive the next data message; `None` once the stream has ended
    async fn next_raw(&mut self) -> Option<Result<Message, GatewayError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), GatewayError>;

    /// Check if the connection is alive
    fn is_connected(&self) -> bool;

    /// Encode a frame with the codec and send it
    async fn send_frame(&mut self, frame: &C::Outbound) -> Result<(), GatewayError>;

    /// Get the next decoded frame
    async fn next_message(&mut self) -> Option<Result<C::Message, GatewayError>>;

    /// Send a keepalive ping
    async fn send_ping(&mut self) -> Result<(), GatewayError> {
        self.send_raw(Message::Ping(Vec::new())).await
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Tungstenite-based WebSocket implementation
pub struct TungsteniteWs<C: WsCodec> {
    url: String,
    write: Option<futures_util::stream::SplitSink<WsStream, Message>>,
    read: Option<futures_util::stream::SplitStream<WsStream>>,
    connected: bool,
    codec: C,
    config: WsConfig,
}

impl<C: WsCodec> TungsteniteWs<C> {
    /// Create a new WebSocket session with the specified codec
    ///
    /// # Arguments
    /// * `url` - The WebSocket URL to connect to
    /// * `codec` - The codec to handle frame encoding/decoding
    pub fn new(url: String, codec: C) -> Self {
        Self {
            url,
            write: None,
            read: None,
            connected: false,
            codec,
            config: WsConfig::default(),
        }
    }

    /// Set custom WebSocket configuration
    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C: WsCodec> WsSession<C> for TungsteniteWs<C> {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&mut self) -> Result<(), GatewayError> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        self.write = None;
        self.read = None;
        self.connected = false;

        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| {
                GatewayError::ConnectionTimeout(format!(
                    "WebSocket connection timeout after {}ms",
                    self.config.connect_timeout_ms
                ))
            })?
            .map_err(|e| match e {
                tungstenite::Error::Url(url_err) => {
                    GatewayError::InvalidEndpoint(format!("{}: {}", self.url, url_err))
                }
                other => {
                    GatewayError::NetworkError(format!("WebSocket connection failed: {}", other))
                }
            })?;

        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);
        self.connected = true;

        Ok(())
    }

    #[instrument(skip(self, msg))]
    async fn send_raw(&mut self, msg: Message) -> Result<(), GatewayError> {
        if !self.connected {
            return Err(GatewayError::NetworkError(
                "WebSocket not connected".to_string(),
            ));
        }

        let write = self.write.as_mut().ok_or_else(|| {
            GatewayError::NetworkError("WebSocket write stream not available".to_string())
        })?;

        if let Err(e) = write.send(msg).await {
            self.connected = false;
            return Err(GatewayError::NetworkError(format!(
                "Failed to send WebSocket message: {}",
                e
            )));
        }
        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<Message, GatewayError>> {
        loop {
            if !self.connected {
                return Some(Err(GatewayError::NetworkError(
                    "WebSocket not connected".to_string(),
                )));
            }

            let read = self.read.as_mut()?;

            match read.next().await {
                Some(Ok(message)) => {
                    // Handle control messages at transport level only
                    match message {
                        Message::Close(frame) => {
                            debug!(?frame, "WebSocket closed by peer");
                            self.connected = false;
                            return None;
                        }
                        Message::Ping(data) => {
                            if let Err(e) = self.send_raw(Message::Pong(data)).await {
                                warn!("Failed to send pong response: {}", e);
                            }
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                        other => return Some(Ok(other)),
                    }
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Some(Err(GatewayError::NetworkError(format!(
                        "WebSocket error: {}",
                        e
                    ))));
                }
                None => {
                    self.connected = false;
                    return None;
                }
            }
        }
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn close(&mut self) -> Result<(), GatewayError> {
        if let Some(write) = self.write.as_mut() {
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        }
        self.connected = false;
        self.write = None;
        self.read = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send_frame(&mut self, frame: &C::Outbound) -> Result<(), GatewayError> {
        let message = self.codec.encode_message(frame)?;
        self.send_raw(message).await
    }

    async fn next_message(&mut self) -> Option<Result<C::Message, GatewayError>> {
        loop {
            match self.next_raw().await {
                Some(Ok(raw_msg)) => match self.codec.decode_message(raw_msg) {
                    Ok(Some(decoded)) => return Some(Ok(decoded)),
                    Ok(None) => {} // Codec chose to ignore this message
                    Err(e) => return Some(Err(e)),
                },
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

/// Exponential reconnect backoff: `min(base * 2^(attempt-1), max)`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Record a failed attempt and return the delay before the next one
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        1u32.checked_shl(self.attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Called after every successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(delays: &[Duration]) -> Vec<u64> {
        delays.iter().map(Duration::as_secs).collect()
    }

    #[test]
    fn test_backoff_sequence_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<Duration> = (0..9).map(|_| backoff.next_delay()).collect();
        assert_eq!(secs(&delays), vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(backoff.attempt(), 9);
    }

    #[test]
    fn test_backoff_resets_after_success() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }
}
