//! Connections and the process-wide connection table.
//!
//! A connection is one TCP link to a peer plus its lifecycle state. Handles
//! are `Arc<Connection>`; whoever holds a clone keeps the connection alive.
//! Owners at rest are the table, route slots, send-queue entries and ID-cache
//! entries; receivers and sender workers hold transient clones.
//!
//! Lock order across the module is table lock, then a connection's state
//! lock, then its send lock. [`ConnectionTable::close`] is the one documented
//! exception: it keeps the state lock held while removing the entry from the
//! table, so nothing can observe a half-closed connection.

use std::io::{ErrorKind, Write};
use std::net::{Shutdown, SocketAddrV4, TcpStream};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::packet::{PACKET_SIZE, Packet};
use super::types::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Known address, no socket yet; a receiver thread will dial it.
    Unconnected,
    /// Socket is live and valid for I/O.
    Active,
    /// Terminal. The socket has been shut down and dropped.
    Closed,
}

/// One TCP link to a peer.
#[derive(Debug)]
pub struct Connection {
    addr: SocketAddrV4,
    /// State lock.
    state: Mutex<ConnState>,
    /// Send lock. Guards the stream slot and serializes writes, so a write
    /// never races the socket teardown in `close`.
    stream: Mutex<Option<TcpStream>>,
}

impl Connection {
    fn new(addr: SocketAddrV4, state: ConnState, stream: Option<TcpStream>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: Mutex::new(state),
            stream: Mutex::new(stream),
        })
    }

    /// The remote address this connection is keyed by.
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// Whether the connection still awaits its dial. Only the owning
    /// receiver thread ever moves a connection out of this state.
    pub fn is_unconnected(&self) -> bool {
        *lock(&self.state) == ConnState::Unconnected
    }

    /// Whether the connection is live for I/O.
    pub fn ok(&self) -> bool {
        *lock(&self.state) == ConnState::Active
    }

    /// Binds a freshly dialed socket to an unconnected connection and
    /// activates it. Happens exactly once per connection.
    pub fn bind_stream(&self, stream: TcpStream) {
        let mut state = lock(&self.state);
        let mut slot = lock(&self.stream);
        *slot = Some(stream);
        *state = ConnState::Active;
    }

    /// A cloned handle of the underlying socket for the receive loop. The
    /// write side stays behind the send lock; a shutdown through either
    /// clone interrupts both directions.
    pub fn reader(&self) -> std::io::Result<TcpStream> {
        let slot = lock(&self.stream);
        match slot.as_ref() {
            Some(stream) => stream.try_clone(),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }

    /// Sends one packet. Returns the number of bytes written; 0 when the
    /// connection is not active (or lost its socket meanwhile).
    ///
    /// The state is observed under the state lock and released before the
    /// write. The state may flip concurrently, but the socket slot is only
    /// mutated under the send lock held here for the whole write, so the
    /// worst case is a write on a socket the peer already tore down, which
    /// the OS reports as an error.
    pub fn send_packet(&self, packet: &Packet) -> std::io::Result<usize> {
        {
            let state = lock(&self.state);
            if *state != ConnState::Active {
                return Ok(0);
            }
        }

        let slot = lock(&self.stream);
        let Some(stream) = slot.as_ref() else {
            return Ok(0);
        };
        let mut stream: &TcpStream = stream;
        loop {
            match stream.write(packet.as_bytes()) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    /// Shuts down the socket without touching state or table membership.
    /// Used to kick a blocked receiver; the receiver then runs the regular
    /// close path itself.
    pub(crate) fn interrupt(&self) {
        let slot = lock(&self.stream);
        if let Some(stream) = slot.as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// The process-wide set of live connections, keyed by `(ip, port)`.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an active connection from an accepted socket and inserts it.
    /// The table keeps one handle, the caller gets the other.
    pub fn create_with_stream(&self, addr: SocketAddrV4, stream: TcpStream) -> Arc<Connection> {
        let conn = Connection::new(addr, ConnState::Active, Some(stream));
        lock(&self.conns).push(Arc::clone(&conn));
        conn
    }

    /// Creates an unconnected connection for `addr` unless the table already
    /// has one with the same address. Returns `None` when it does.
    pub fn create_unless_exists(&self, addr: SocketAddrV4) -> Option<Arc<Connection>> {
        let mut conns = lock(&self.conns);
        if conns.iter().any(|c| c.addr == addr) {
            return None;
        }
        let conn = Connection::new(addr, ConnState::Unconnected, None);
        conns.push(Arc::clone(&conn));
        Some(conn)
    }

    /// Closes a connection: removes it from the table, shuts the socket
    /// down and drops it. Called exactly once, by the receiver that owns
    /// the connection. The caller still drops its own handle afterwards.
    pub fn close(&self, conn: &Arc<Connection>) {
        let mut state = lock(&conn.state);

        {
            let mut conns = lock(&self.conns);
            if let Some(pos) = conns.iter().position(|c| Arc::ptr_eq(c, conn)) {
                conns.swap_remove(pos);
            }
        }

        if *state == ConnState::Active {
            let mut slot = lock(&conn.stream);
            if let Some(stream) = slot.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            *state = ConnState::Closed;
        }
        debug!("closed connection to {}", conn.addr);
    }

    /// Owned handles to every current connection. Broadcast iterates this
    /// without holding the table lock across sends.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        lock(&self.conns).iter().map(Arc::clone).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.conns).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.conns).is_empty()
    }
}

/// Logs the outcome of a packet send at debug level.
pub(crate) fn log_send(conn: &Connection, packet: &Packet, result: &std::io::Result<usize>) {
    match result {
        Ok(n) if *n == PACKET_SIZE => {
            debug!("sent packet id {} to {}", packet.id(), conn.addr());
        }
        Ok(n) => {
            debug!(
                "failed sending packet id {} to {} ({}/{} bytes)",
                packet.id(),
                conn.addr(),
                n,
                PACKET_SIZE
            );
        }
        Err(e) => {
            debug!("failed sending packet id {} to {}: {}", packet.id(), conn.addr(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    /// A connected local socket pair.
    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        (local, peer)
    }

    #[test]
    fn test_create_unless_exists_dedups_by_addr() {
        let table = ConnectionTable::new();
        let first = table.create_unless_exists(addr(4000));
        assert!(first.is_some());
        assert!(table.create_unless_exists(addr(4000)).is_none());
        // different port is a different peer
        assert!(table.create_unless_exists(addr(4001)).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_create_hands_out_two_owners() {
        let table = ConnectionTable::new();
        let conn = table.create_unless_exists(addr(4000)).unwrap();
        // one handle here, one in the table
        assert_eq!(Arc::strong_count(&conn), 2);
        drop(table);
        assert_eq!(Arc::strong_count(&conn), 1);
    }

    #[test]
    fn test_send_on_unconnected_is_zero_bytes() {
        let table = ConnectionTable::new();
        let conn = table.create_unless_exists(addr(4000)).unwrap();
        let n = conn.send_packet(&Packet::content(1, 0, b"x")).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_send_writes_full_packet() {
        let (local, mut peer) = stream_pair();
        let table = ConnectionTable::new();
        let conn = table.create_with_stream(addr(4000), local);

        let n = conn.send_packet(&Packet::content(9, 1, b"hello")).unwrap();
        assert_eq!(n, PACKET_SIZE);

        let mut buf = [0u8; PACKET_SIZE];
        peer.read_exact(&mut buf).unwrap();
        let received = Packet::from_wire(buf);
        assert_eq!(received.id(), 9);
        assert_eq!(&received.payload()[..5], b"hello");
    }

    #[test]
    fn test_close_removes_and_deactivates() {
        let (local, _peer) = stream_pair();
        let table = ConnectionTable::new();
        let conn = table.create_with_stream(addr(4000), local);
        assert!(conn.ok());
        assert_eq!(table.len(), 1);

        table.close(&conn);
        assert!(!conn.ok());
        assert!(table.is_empty());
        // sends after close are swallowed, not an error
        let n = conn.send_packet(&Packet::content(1, 0, b"x")).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_bind_stream_activates() {
        let table = ConnectionTable::new();
        let conn = table.create_unless_exists(addr(4000)).unwrap();
        assert!(conn.is_unconnected());
        assert!(!conn.ok());

        let (local, _peer) = stream_pair();
        conn.bind_stream(local);
        assert!(conn.ok());
        assert!(!conn.is_unconnected());
    }

    #[test]
    fn test_snapshot_owns_every_entry() {
        let table = ConnectionTable::new();
        let a = table.create_unless_exists(addr(4000)).unwrap();
        let b = table.create_unless_exists(addr(4001)).unwrap();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(Arc::strong_count(&a), 3);
        assert_eq!(Arc::strong_count(&b), 3);

        drop(snapshot);
        assert_eq!(Arc::strong_count(&a), 2);
    }

    #[test]
    fn test_interrupt_unblocks_a_reader() {
        let (local, peer) = stream_pair();
        let table = ConnectionTable::new();
        let conn = table.create_with_stream(addr(4000), local);

        let mut reader = conn.reader().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; PACKET_SIZE];
            reader.read_exact(&mut buf).is_err()
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.interrupt();
        assert!(handle.join().unwrap());
        drop(peer);
    }
}
