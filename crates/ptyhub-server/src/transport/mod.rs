//! Client transport: WebSocket handshake helpers and the gateway loop.

pub mod gateway;
pub mod websocket;

pub use gateway::{run_connection, GatewaySettings};
