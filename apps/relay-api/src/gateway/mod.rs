//! WebSocket gateway: the transport-facing surface of the hub.

pub mod events;
pub mod server;
