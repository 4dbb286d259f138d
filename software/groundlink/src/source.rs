//! Local command producers.
//!
//! Each command source is a UDP port on the ground host where a local tool
//! drops already-encoded command datagrams. The routing loop drains every
//! source once per cycle without blocking.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::trace;

use crate::error::Result;
use crate::socket::{Datagram, UdpLink};

/// A bound, nonblocking socket for one local command producer.
pub struct CommandSource {
    port: u16,
    link: UdpLink,
}

impl CommandSource {
    /// Bind a command source on `(ground_ip, port)`.
    pub fn bind(ground_ip: IpAddr, port: u16) -> Result<Self> {
        let link = UdpLink::bind("command source", SocketAddr::new(ground_ip, port), Duration::ZERO)?;
        // Port 0 resolves to whatever the OS picked
        let port = link.local_addr().map(|a| a.port()).unwrap_or(port);
        Ok(Self { port, link })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    /// Move up to `limit` pending datagrams into the inspection queue and,
    /// if given, the outbound command queue.
    ///
    /// Returns the number of datagrams taken, or a fatal socket error.
    pub fn drain(
        &mut self,
        limit: usize,
        echo: &Sender<Datagram>,
        outbound: Option<&Sender<Vec<u8>>>,
    ) -> Result<usize> {
        let mut n = 0;
        while n < limit {
            let Some(dgram) = self.link.recv()? else {
                break;
            };
            n += 1;
            trace!(
                "Command source {} received {} bytes from {}",
                self.port,
                dgram.len(),
                dgram.source
            );
            if let Some(outbound) = outbound {
                // The router holds the receiving end for its whole lifetime
                let _ = outbound.send(dgram.payload.clone());
            }
            let _ = echo.send(dgram);
        }
        Ok(n)
    }

    /// Release the port. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.link.close();
    }
}
