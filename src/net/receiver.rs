//! Per-connection receive loop and packet dispatch.
//!
//! Every connection gets one detached thread. Unconnected connections
//! (created by a neighbor introduction) are dialed here first, so the
//! introducing receiver never blocks on someone else's connect.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use super::connection::{Connection, log_send};
use super::node::Mesh;
use super::packet::{PACKET_SIZE, Packet, PacketKind};

/// Spawns the receive thread for a connection. The thread takes over the
/// given handle and releases it on exit.
pub fn spawn(mesh: &Arc<Mesh>, conn: Arc<Connection>) -> std::io::Result<()> {
    let mesh = Arc::clone(mesh);
    thread::Builder::new()
        .name(format!("recv-{}", conn.addr()))
        .spawn(move || run(mesh, conn))?;
    Ok(())
}

fn run(mesh: Arc<Mesh>, conn: Arc<Connection>) {
    if conn.is_unconnected() {
        debug!("dialing {}", conn.addr());
        match TcpStream::connect(conn.addr()) {
            Ok(stream) => {
                conn.bind_stream(stream);
                debug!("connected to {}", conn.addr());
            }
            Err(e) => {
                debug!("cannot connect to {}: {}", conn.addr(), e);
                mesh.connections.close(&conn);
                return;
            }
        }
    }

    let mut reader = match conn.reader() {
        Ok(reader) => reader,
        Err(e) => {
            debug!("no readable socket for {}: {}", conn.addr(), e);
            mesh.connections.close(&conn);
            return;
        }
    };

    // complete packets only; a short read ends the connection
    let mut buf = [0u8; PACKET_SIZE];
    while reader.read_exact(&mut buf).is_ok() {
        let packet = Packet::from_wire(buf);
        match packet.kind() {
            Some(PacketKind::Content) => on_content(&mesh, &conn, packet),
            Some(PacketKind::Ack) => on_ack(&mesh, &conn, &packet),
            Some(PacketKind::Neighbor) => on_neighbor(&mesh, &packet),
            None => debug!("unknown packet type from {}, ignored", conn.addr()),
        }
    }

    debug!("receiver for {} done", conn.addr());
    mesh.connections.close(&conn);
}

fn on_content(mesh: &Arc<Mesh>, conn: &Arc<Connection>, mut packet: Packet) {
    let dest = packet.dest();
    let id = packet.id();
    debug!("received 'C' packet id {} for {}", id, dest);

    if mesh.idcache.put(conn, dest, id) {
        debug!("packet id {} seen before, dropped", id);
        return;
    }

    if mesh.role.is_terminus(dest) {
        debug!(
            "packet id {} reached its destination, content {}..",
            id,
            hex::encode(&packet.payload()[..8])
        );
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(packet.payload()).and_then(|()| stdout.flush()) {
            debug!("cannot deliver content: {}", e);
        }

        // answer with the ack on the connection the content came in on
        packet.set_kind(PacketKind::Ack);
        let result = conn.send_packet(&packet);
        log_send(conn, &packet, &result);
        return;
    }

    mesh.sendq.add(&packet, conn);
    debug!("packet id {} queued for forwarding", id);
}

fn on_ack(mesh: &Arc<Mesh>, conn: &Arc<Connection>, packet: &Packet) {
    let dest = packet.dest();
    let id = packet.id();
    debug!("received 'O' packet id {} for {}", id, dest);

    let Some((origin, time_sent)) = mesh.idcache.take_origin(dest, id) else {
        debug!("ack for unknown or already-acked id {}, dropped", id);
        return;
    };

    // the connection the ack came in on is a proven path
    mesh.routes.mark_alive(conn, dest, time_sent);

    let result = origin.send_packet(packet);
    log_send(&origin, packet, &result);
}

fn on_neighbor(mesh: &Arc<Mesh>, packet: &Packet) {
    let addr = packet.neighbor_addr();
    debug!("received 'N' packet for {}", addr);

    let Some(newconn) = mesh.connections.create_unless_exists(addr) else {
        debug!("already connected to {}, ignored", addr);
        return;
    };

    if let Err(e) = spawn(mesh, Arc::clone(&newconn)) {
        debug!("cannot spawn receiver for {}: {}", addr, e);
        mesh.connections.close(&newconn);
    }
}
