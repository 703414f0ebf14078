//! The node: the shared context, the accept loop and test-facing lifecycle.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::connection::ConnectionTable;
use super::idcache::IdCache;
use super::routing::RoutingTable;
use super::sendq::SendQueue;
use super::sock::{self, NetError};
use super::types::{DEFAULT_PORT, DEFAULT_ROUTE_TIMEOUT_MS, Role};
use super::{receiver, sender};

/// Everything the accept loop, receivers and sender workers share. One
/// instance per node, created before any thread starts.
pub struct Mesh {
    pub role: Role,
    pub connections: ConnectionTable,
    pub idcache: IdCache,
    pub sendq: SendQueue,
    pub routes: RoutingTable,
    stopping: AtomicBool,
}

impl Mesh {
    pub fn new(role: Role, route_timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            role,
            connections: ConnectionTable::new(),
            idcache: IdCache::new(),
            sendq: SendQueue::new(),
            routes: RoutingTable::new(route_timeout_ms),
            stopping: AtomicBool::new(false),
        })
    }
}

/// Node startup parameters.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    pub role: Role,
    pub route_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            role: Role::Normal,
            route_timeout_ms: DEFAULT_ROUTE_TIMEOUT_MS,
        }
    }
}

/// A bound but not yet running node.
pub struct Node {
    mesh: Arc<Mesh>,
    listener: TcpListener,
    local_addr: SocketAddrV4,
}

impl Node {
    /// Binds the listening socket and builds the shared context.
    pub fn bind(config: NodeConfig) -> Result<Self, NetError> {
        let listener = sock::listen(config.port)?;
        // report a dialable address; the socket itself listens on any-address
        let local_addr = match listener.local_addr() {
            Ok(SocketAddr::V4(addr)) => SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port()),
            Ok(SocketAddr::V6(_)) | Err(_) => SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.port),
        };
        Ok(Self {
            mesh: Mesh::new(config.role, config.route_timeout_ms),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Starts the sender pool and runs the accept loop on the current
    /// thread. This is the CLI path; it returns only on a fatal accept
    /// error.
    pub fn run(self) -> Result<(), NetError> {
        sender::spawn_pool(&self.mesh).map_err(NetError::Accept)?;
        accept_loop(&self.mesh, &self.listener).map_err(NetError::Accept)
    }

    /// Starts the sender pool and the accept loop on a background thread,
    /// returning a handle that can stop everything. This is the test path.
    pub fn start(self) -> std::io::Result<NodeHandle> {
        sender::spawn_pool(&self.mesh)?;
        let mesh = Arc::clone(&self.mesh);
        let listener = self.listener;
        let acceptor = thread::Builder::new()
            .name(format!("accept-{}", self.local_addr))
            .spawn(move || {
                if let Err(e) = accept_loop(&mesh, &listener) {
                    warn!("accept loop ended: {}", e);
                }
            })?;
        Ok(NodeHandle {
            mesh: self.mesh,
            local_addr: self.local_addr,
            acceptor: Some(acceptor),
        })
    }
}

/// A running node started with [`Node::start`].
pub struct NodeHandle {
    mesh: Arc<Mesh>,
    local_addr: SocketAddrV4,
    acceptor: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Stops the node: wakes the sender pool through the queue, interrupts
    /// every receiver's blocked read, and pokes the listener so the accept
    /// loop observes the stop flag.
    pub fn shutdown(mut self) {
        self.mesh.stopping.store(true, Ordering::SeqCst);
        self.mesh.sendq.shut_down();
        for conn in self.mesh.connections.snapshot() {
            conn.interrupt();
        }

        let poke = SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.local_addr.port());
        let _ = TcpStream::connect(poke);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

/// The accept loop: one receiver thread per accepted connection.
fn accept_loop(mesh: &Arc<Mesh>, listener: &TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if out_of_descriptors(&e) => {
                warn!("accept: {}, retrying", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        if mesh.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }

        let SocketAddr::V4(peer) = peer else {
            // IPv4 listener; nothing else can arrive
            continue;
        };
        debug!("new inbound connection from {}", peer);

        let conn = mesh.connections.create_with_stream(peer, stream);
        if let Err(e) = receiver::spawn(mesh, Arc::clone(&conn)) {
            warn!("cannot spawn receiver for {}: {}", peer, e);
            mesh.connections.close(&conn);
        }
    }
}

/// The process ran out of file descriptors; worth retrying once a
/// connection goes away.
fn out_of_descriptors(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bind_on_ephemeral_port() {
        let node = Node::bind(NodeConfig {
            port: 0,
            ..NodeConfig::default()
        })
        .unwrap();
        assert!(node.local_addr().port() > 0);
    }

    #[test]
    fn test_accepted_connection_lands_in_table() {
        let node = Node::bind(NodeConfig {
            port: 0,
            ..NodeConfig::default()
        })
        .unwrap();
        let addr = node.local_addr();
        let handle = node.start().unwrap();

        let peer = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.mesh().connections.len(), 1);

        drop(peer);
        std::thread::sleep(Duration::from_millis(100));
        // the receiver noticed the hangup and cleaned up
        assert_eq!(handle.mesh().connections.len(), 0);

        handle.shutdown();
    }

    #[test]
    fn test_shutdown_returns() {
        let node = Node::bind(NodeConfig {
            port: 0,
            ..NodeConfig::default()
        })
        .unwrap();
        let handle = node.start().unwrap();
        handle.shutdown();
    }
}
