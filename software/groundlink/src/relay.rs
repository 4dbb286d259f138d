//! Outbound command path to the flight target.

use std::net::SocketAddr;

use crossbeam::channel::{Receiver, TryRecvError};
use tracing::{trace, warn};

use crate::error::Result;
use crate::socket::UdpLink;

/// Relays queued command datagrams, unmodified and in enqueue order,
/// to the flight target's command-ingest address.
pub struct CommandRelay {
    target: SocketAddr,
    link: UdpLink,
    queue: Receiver<Vec<u8>>,
}

impl CommandRelay {
    /// Open the connected command socket. The target cannot change afterward.
    pub fn open(target: SocketAddr, queue: Receiver<Vec<u8>>) -> Result<Self> {
        let link = UdpLink::connect("flight command", target)?;
        Ok(Self {
            target,
            link,
            queue,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Relay up to `limit` queued commands.
    ///
    /// Each datagram leaves the queue before it is sent; a failed send is
    /// logged and the datagram is not retried.
    /// Returns the number of datagrams taken off the queue.
    pub fn relay_pending(&mut self, limit: usize) -> usize {
        let mut n = 0;
        while n < limit {
            let payload = match self.queue.try_recv() {
                Ok(payload) => payload,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            n += 1;
            match self.link.send(&payload) {
                Ok(_) => trace!("Relayed {} byte command to {}", payload.len(), self.target),
                Err(e) => warn!(
                    "Dropped {} byte command to {}: {e}",
                    payload.len(),
                    self.target
                ),
            }
        }
        n
    }

    pub fn close(&mut self) {
        self.link.close();
    }
}
