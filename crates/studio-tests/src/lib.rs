//! End-to-end helpers: a fake gateway on a Unix socket and a real
//! [`studio_gateway::GatewayClient`] talking to it.

pub mod harness;
