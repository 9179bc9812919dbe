//! Client transports.

pub mod websocket;

pub use websocket::WsConnection;
