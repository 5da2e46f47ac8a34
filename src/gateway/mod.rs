pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod events;
pub mod identity;
pub mod pending;
pub mod router;
pub mod session;
pub mod state;

use crate::core::config::GatewayConfig;
use crate::core::errors::GatewayError;
use crate::core::traits::GatewayListener;
use std::sync::Arc;

// Re-export main types for easier importing
pub use auth::{AuthPayload, ConnectParams, HelloSnapshot, PROTOCOL_VERSION};
pub use client::GatewayClient;
pub use codec::{EventFrame, Frame, GatewayCodec, RequestFrame, ResponseFrame};
pub use events::{extract_text, GatewayEvent};
pub use identity::DeviceIdentity;
pub use pending::ResponseHandle;
pub use session::SessionInfo;

/// Create a gateway client and start connecting in the background
pub fn create_gateway_client(
    config: GatewayConfig,
    listener: Arc<dyn GatewayListener>,
) -> Result<GatewayClient, GatewayError> {
    let client = GatewayClient::new(config, listener)?;
    client.start()?;
    Ok(client)
}
