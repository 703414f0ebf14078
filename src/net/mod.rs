//! Mesh overlay networking: connections, dedup cache, send queue, adaptive
//! routing, and the receiver/sender machinery tying them together.

pub mod connection;
pub mod idcache;
pub mod node;
pub mod packet;
pub mod receiver;
pub mod routing;
pub mod sender;
pub mod sendq;
pub mod sock;
pub mod types;

// Re-exports
pub use connection::{Connection, ConnectionTable};
pub use idcache::{CACHE_SLOTS, IdCache};
pub use node::{Mesh, Node, NodeConfig, NodeHandle};
pub use packet::{CONTENT_SIZE, PACKET_SIZE, Packet, PacketKind};
pub use routing::RoutingTable;
pub use sendq::{SEND_QUEUE_SIZE, SendQueue};
pub use sock::NetError;
pub use types::{
    DEFAULT_PORT, DEFAULT_ROUTE_TIMEOUT_MS, MIN_ROUTE_TIMEOUT_MS, NUM_SENDERS, Role, now_ms,
};
