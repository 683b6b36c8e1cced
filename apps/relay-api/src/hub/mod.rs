//! The real-time fan-out hub: connection index, broadcast engine, and the
//! sharded pool that routes users onto single-owner command loops.

pub mod broadcast;
pub mod conn;
pub mod index;
pub mod pool;
pub mod shard;

pub use broadcast::{Broadcast, BroadcastTarget, EventPayload, Reliability};
pub use conn::{ConnState, DeliveryError, WebConn};
pub use pool::HubPool;
pub use shard::{Hub, HubConfig};
