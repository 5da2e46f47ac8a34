/// Kernel - protocol-agnostic transport layer
///
/// The kernel contains only transport and authentication primitives; it knows
/// nothing about gateway frames, sessions, or events.
///
/// # Architecture
///
/// ## Transport Layer
/// - `WsSession`: WebSocket connection management
/// - `TungsteniteWs`: tokio-tungstenite implementation
/// - `Backoff`: bounded exponential reconnect delay
///
/// ## Authentication
/// - `Signer`: pluggable payload signing interface
/// - `Ed25519Signer`: Ed25519 device keys
///
/// ## Message Handling
/// - `WsCodec`: protocol-specific frame encoding/decoding
///
/// # Example
/// ```rust,no_run
/// use clawlink::core::kernel::*;
/// use clawlink::gateway::codec::{Frame, GatewayCodec, RequestFrame};
///
/// # async fn example() -> Result<(), clawlink::GatewayError> {
/// let mut ws = TungsteniteWs::new("ws://localhost:18789".to_string(), GatewayCodec::new());
/// ws.connect().await?;
///
/// // The first inbound frame from a gateway is the connect challenge
/// if let Some(frame) = ws.next_message().await {
///     println!("{:?}", frame?);
/// }
/// ws.send_frame(&Frame::Request(RequestFrame::new("1", "sessions.list", None))).await?;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod signer;
pub mod ws;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use signer::{verify_ed25519, Ed25519Signer, Signer};
pub use ws::{Backoff, TungsteniteWs, WsConfig, WsSession};
