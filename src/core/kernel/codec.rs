use crate::core::errors::GatewayError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for converting between raw WebSocket messages and protocol frames
///
/// The transport stays protocol-agnostic; everything that knows about the
/// shape of a frame lives behind this trait.
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing parsed inbound frames
    type Message: Send;

    /// The type representing outbound frames
    type Outbound: Send + Sync;

    /// Encode an outbound frame into a WebSocket message
    fn encode_message(&self, frame: &Self::Outbound) -> Result<Message, GatewayError>;

    /// Decode a raw WebSocket message into a typed frame
    ///
    /// Control messages (ping, pong, close) are handled at the transport level.
    ///
    /// # Returns
    /// - `Ok(Some(frame))` - Successfully decoded frame
    /// - `Ok(None)` - Message was ignored by the codec
    /// - `Err(error)` - Message could not be decoded; the stream itself is still usable
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, GatewayError>;
}
