//! meshy: a peer-to-peer mesh node forwarding fixed-size packets through a
//! dynamically discovered overlay of TCP neighbors.
//!
//! Content packets (`C`) flood or follow learned routes toward the node
//! whose role matches their destination bit; acknowledgements (`O`) are
//! steered back along the recorded path and validate routes as they go;
//! neighbor introductions (`N`) grow the overlay.

pub mod net;

pub use net::{Mesh, NetError, Node, NodeConfig, NodeHandle, Packet, PacketKind, Role};
