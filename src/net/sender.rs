//! The sender pool: a fixed set of workers draining the send queue.
//!
//! Each dequeued packet is unicast along its learned route when one is
//! usable, otherwise broadcast to every connection except the one it came
//! in on. Loops wider than that immediate echo are cut off by the id cache.

use std::sync::Arc;
use std::thread;

use tracing::debug;

use super::connection::{Connection, log_send};
use super::node::Mesh;
use super::packet::Packet;
use super::types::NUM_SENDERS;

/// Starts the worker pool. Workers run until the send queue shuts down.
pub fn spawn_pool(mesh: &Arc<Mesh>) -> std::io::Result<()> {
    debug!("starting {} sender worker(s)", NUM_SENDERS);
    for i in 0..NUM_SENDERS {
        let mesh = Arc::clone(mesh);
        thread::Builder::new()
            .name(format!("send-{i}"))
            .spawn(move || run(mesh))?;
    }
    Ok(())
}

fn run(mesh: Arc<Mesh>) {
    while let Some((packet, origin)) = mesh.sendq.get() {
        match mesh.routes.get(&packet, &mesh.idcache) {
            Some(route) => {
                debug!("unicast for packet id {} to {}", packet.id(), packet.dest());
                let result = route.send_packet(&packet);
                log_send(&route, &packet, &result);
            }
            None => {
                debug!("broadcast for packet id {} to {}", packet.id(), packet.dest());
                broadcast(&mesh, &packet, &origin);
            }
        }
    }
}

/// Sends to every current connection except the packet's origin.
fn broadcast(mesh: &Mesh, packet: &Packet, origin: &Arc<Connection>) {
    for conn in mesh.connections.snapshot() {
        if Arc::ptr_eq(&conn, origin) {
            continue;
        }
        let result = conn.send_packet(packet);
        log_send(&conn, packet, &result);
    }
}
