pub mod client;
pub mod error;
pub mod protocol;

pub use client::{
    ConnectOptions, DEFAULT_GATEWAY_URL, GatewayClient, GatewayEndpoint, GatewayRpc,
    GatewayStatus, call_typed,
};
pub use error::{GatewayError, GatewayResult};
