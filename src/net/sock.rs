//! Socket setup helpers and the network error type.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use super::types::LISTEN_BACKLOG;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("cannot listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
    #[error("cannot resolve {0} to an IPv4 address")]
    Resolve(String),
}

/// Opens the listening socket: IPv4 any-address, `SO_REUSEADDR`, backlog 10.
pub fn listen(port: u16) -> Result<TcpListener, NetError> {
    let err = |source| NetError::Listen { port, source };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(err)?;
    socket.set_reuse_address(true).map_err(err)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).map_err(err)?;
    socket.listen(LISTEN_BACKLOG).map_err(err)?;
    Ok(socket.into())
}

/// Resolves a host/port pair to its first IPv4 address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddrV4, NetError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Resolve(format!("{host}:{port}")))?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| NetError::Resolve(format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_on_ephemeral_port() {
        let listener = listen(0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_listen_port_conflict_reports_port() {
        let listener = listen(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        // second listener on the same port must fail despite SO_REUSEADDR
        let err = listen(port).unwrap_err();
        assert!(err.to_string().contains(&port.to_string()));
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("localhost", 3333).unwrap();
        assert_eq!(addr.port(), 3333);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_resolve_numeric() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_resolve_garbage_fails() {
        assert!(resolve("no.such.host.invalid", 1).is_err());
    }
}
