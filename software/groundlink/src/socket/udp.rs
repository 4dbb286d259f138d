//! Stdlib UDP socket with the open/close lifecycle the router needs

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, info};

use groundlink_shared::MAX_DATAGRAM_LEN;

use super::{Datagram, is_idle, is_send_echo};
use crate::error::{Result, RouterError};

/// A named UDP socket that can be closed from its owning loop
/// and reports receive timeouts as "no data" instead of errors.
pub struct UdpLink {
    name: &'static str,
    socket: Option<UdpSocket>,
    rxbuf: Vec<u8>,
}

impl UdpLink {
    /// Bind a receive socket.
    ///
    /// With a nonzero `timeout`, receives block for at most that long;
    /// a zero `timeout` puts the socket in nonblocking mode.
    pub fn bind(name: &'static str, addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|source| RouterError::Bind {
            what: name,
            addr,
            source,
        })?;
        let link = Self::from_socket(name, socket);
        link.set_timeout(timeout)?;
        info!(
            "Bound {name} socket on {}",
            link.local_addr().unwrap_or(addr)
        );
        Ok(link)
    }

    /// Open a send-only socket with its destination fixed to `target`.
    ///
    /// The local end is left to the OS (unspecified address, ephemeral port)
    /// so the route to the target picks the source interface.
    pub fn connect(name: &'static str, target: SocketAddr) -> Result<Self> {
        let local = unspecified_for(target);
        let socket = UdpSocket::bind(local).map_err(|source| RouterError::Bind {
            what: name,
            addr: local,
            source,
        })?;
        socket.connect(target).map_err(|source| RouterError::Bind {
            what: name,
            addr: target,
            source,
        })?;
        info!("Connected {name} socket to {target}");
        Ok(Self::from_socket(name, socket))
    }

    fn from_socket(name: &'static str, socket: UdpSocket) -> Self {
        Self {
            name,
            socket: Some(socket),
            rxbuf: vec![0; MAX_DATAGRAM_LEN],
        }
    }

    fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let sock = self.socket()?;
        let configured = if timeout.is_zero() {
            sock.set_nonblocking(true)
        } else {
            sock.set_nonblocking(false)
                .and_then(|_| sock.set_read_timeout(Some(timeout)))
        };
        configured.map_err(|e| RouterError::option(self.name, e))
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| RouterError::socket(self.name, closed()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Drop the inner socket, releasing the port. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Closed {} socket", self.name);
        }
    }

    /// Receive one datagram, if one arrives within the socket's timeout.
    ///
    /// Timeouts and ICMP echoes of earlier sends read as `Ok(None)`;
    /// any other error is fatal to the owning loop.
    pub fn recv(&mut self) -> Result<Option<Datagram>> {
        let Some(sock) = self.socket.as_ref() else {
            return Ok(None);
        };
        match sock.recv_from(&mut self.rxbuf) {
            Ok((size, addr)) => Ok(Some(Datagram::new(self.rxbuf[..size].to_vec(), addr))),
            Err(e) if is_idle(&e) => Ok(None),
            Err(e) if is_send_echo(&e) => {
                debug!("{} socket saw unreachable destination: {e}", self.name);
                Ok(None)
            }
            Err(e) => Err(RouterError::socket(self.name, e)),
        }
    }

    /// Send to an arbitrary destination.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.as_ref() {
            Some(sock) => sock.send_to(payload, addr),
            None => Err(closed()),
        }
    }

    /// Send to the connected destination.
    pub fn send(&self, payload: &[u8]) -> io::Result<usize> {
        match self.socket.as_ref() {
            Some(sock) => sock.send(payload),
            None => Err(closed()),
        }
    }
}

/// Wildcard address with an ephemeral port, in the same family as `target`.
fn unspecified_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn recv_times_out_as_none() {
        let mut link = UdpLink::bind("test", loopback(), Duration::from_millis(20)).unwrap();
        assert!(link.recv().unwrap().is_none());

        let mut nonblocking = UdpLink::bind("test", loopback(), Duration::ZERO).unwrap();
        assert!(nonblocking.recv().unwrap().is_none());
    }

    #[test]
    fn connected_send_reaches_target() {
        let mut rx = UdpLink::bind("rx", loopback(), Duration::from_secs(1)).unwrap();
        let target = rx.local_addr().unwrap();
        let tx = UdpLink::connect("tx", target).unwrap();

        tx.send(b"noop").unwrap();
        let dgram = rx.recv().unwrap().unwrap();
        assert_eq!(dgram.payload(), b"noop");
        assert_eq!(Some(dgram.source), tx.local_addr());
    }

    #[test]
    fn connect_leaves_source_address_to_the_os() {
        assert_eq!(
            unspecified_for("192.0.2.3:1234".parse().unwrap()),
            "0.0.0.0:0".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            unspecified_for("[2001:db8::3]:1234".parse().unwrap()),
            "[::]:0".parse::<SocketAddr>().unwrap()
        );

        // Off-host target: the connect may fail for lack of a route on this
        // machine, but never because the source is pinned to loopback
        match UdpLink::connect("tx", "192.0.2.3:1234".parse().unwrap()) {
            Ok(link) => {
                let local = link.local_addr().unwrap();
                assert!(!local.ip().is_loopback());
            }
            Err(RouterError::Bind { source, .. }) => {
                assert_ne!(source.kind(), io::ErrorKind::InvalidInput);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn double_close_is_harmless() {
        let mut link = UdpLink::bind("test", loopback(), Duration::ZERO).unwrap();
        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(link.local_addr().is_none());
        assert!(link.recv().unwrap().is_none());
        assert!(link.send_to(b"x", "127.0.0.1:9".parse().unwrap()).is_err());
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = UdpLink::bind("first", loopback(), Duration::ZERO).unwrap();
        let taken = first.local_addr().unwrap();
        let second = UdpLink::bind("second", taken, Duration::ZERO);
        assert!(matches!(second, Err(RouterError::Bind { what: "second", .. })));
    }
}
