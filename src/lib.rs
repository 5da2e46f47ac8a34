pub mod core;
pub mod gateway;

pub use core::{
    config::{ConfigError, GatewayConfig},
    errors::GatewayError,
    traits::{ClientEvent, GatewayListener, NoopListener},
    types::*,
};
pub use gateway::{create_gateway_client, GatewayClient, ResponseHandle};
