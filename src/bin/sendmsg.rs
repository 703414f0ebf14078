//! Utility to inject packets into a running mesh node.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::process::exit;
use std::time::Duration;

use clap::{Parser, Subcommand};
use meshy::net::packet::{PACKET_SIZE, Packet, PacketKind};
use meshy::net::sock;

/// How long to wait for the returning ack.
const RESPONSE_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "sendmsg", version, about = "Send packets to a mesh node")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Introduce <ADD_HOST>:<ADD_PORT> as a neighbor to the node
    N {
        host: String,
        port: u16,
        add_host: String,
        add_port: u16,
    },
    /// Send content towards 'q' or 'z' and wait for the ack
    C {
        host: String,
        port: u16,
        /// Destination role: 'q' or 'z'
        dest: String,
        id: u16,
        msg: String,
    },
    /// Send a bare ack towards 'q' or 'z'
    O {
        host: String,
        port: u16,
        /// Destination role: 'q' or 'z'
        dest: String,
        id: u16,
    },
}

fn dest_bit(dest: &str) -> u8 {
    if dest == "z" { 1 } else { 0 }
}

fn main() {
    let args = Args::parse();

    let (host, port, packet, await_response) = match args.cmd {
        Cmd::N {
            host,
            port,
            add_host,
            add_port,
        } => {
            let neighbor = match sock::resolve(&add_host, add_port) {
                Ok(addr) => addr,
                Err(e) => {
                    eprintln!("{e}");
                    exit(1);
                }
            };
            println!("sending 'N' packet with {neighbor} to {host}:{port}");
            (host, port, Packet::neighbor(neighbor), false)
        }
        Cmd::C {
            host,
            port,
            dest,
            id,
            msg,
        } => {
            println!("sending 'C' packet to {host}:{port}");
            (host, port, Packet::content(id, dest_bit(&dest), msg.as_bytes()), true)
        }
        Cmd::O { host, port, dest, id } => {
            let mut packet = Packet::content(id, dest_bit(&dest), b"some ok packet");
            packet.set_kind(PacketKind::Ack);
            println!("sending 'O' packet to {host}:{port}");
            (host, port, packet, false)
        }
    };

    let addr = match sock::resolve(&host, port) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let mut stream = match TcpStream::connect(addr) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("cannot connect to {addr}: {e}");
            exit(1);
        }
    };

    if let Err(e) = stream.write_all(packet.as_bytes()) {
        eprintln!("packet not sent: {e}");
        exit(1);
    }
    println!("packet sent");

    if await_response {
        let _ = stream.set_read_timeout(Some(RESPONSE_WAIT));
        let mut buf = [0u8; PACKET_SIZE];
        match stream.read_exact(&mut buf) {
            Ok(()) => {
                let response = Packet::from_wire(buf);
                println!(
                    "response received for id {} to {}",
                    response.id(),
                    response.dest()
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                println!("timeout waiting for a response");
            }
            Err(e) => {
                eprintln!("failed reading response: {e}");
                exit(1);
            }
        }
    }
}
