//! Telemetry downlink and fanout to subscribers.

use std::net::SocketAddr;
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{trace, warn};

use crate::error::Result;
use crate::registry::AddressRegistry;
use crate::socket::{Datagram, UdpLink};

/// Receives telemetry from the flight target and forwards a copy of each
/// frame to the inspection queue and to every registered subscriber.
pub struct TelemetryFanout {
    link: UdpLink,
    registry: AddressRegistry,
    inspection: Sender<Datagram>,
}

impl TelemetryFanout {
    /// Bind the downlink socket with the given receive timeout.
    pub fn bind(
        addr: SocketAddr,
        timeout: Duration,
        registry: AddressRegistry,
        inspection: Sender<Datagram>,
    ) -> Result<Self> {
        let link = UdpLink::bind("telemetry downlink", addr, timeout)?;
        Ok(Self {
            link,
            registry,
            inspection,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    /// Receive and forward up to `limit` datagrams, stopping at the first
    /// receive timeout.
    ///
    /// Returns the number of datagrams received, or a fatal socket error.
    pub fn drain(&mut self, limit: usize) -> Result<usize> {
        let mut n = 0;
        while n < limit {
            let Some(dgram) = self.link.recv()? else {
                break;
            };
            n += 1;
            self.forward(dgram);
        }
        Ok(n)
    }

    /// Forward one datagram. Returns the number of subscribers it was sent to.
    ///
    /// Undersized frames are dropped silently. Frames are queued for
    /// inspection before any subscriber send is attempted. A failed send to one
    /// subscriber does not stop delivery to the rest.
    pub fn forward(&self, dgram: Datagram) -> usize {
        if !dgram.is_telemetry_frame() {
            trace!("Dropped {} byte datagram from {}", dgram.len(), dgram.source);
            return 0;
        }

        if let Some(hdr) = dgram.header() {
            trace!(
                "Telemetry apid {:#05x} seq {} ({} bytes) from {}",
                hdr.apid(),
                hdr.sequence_count(),
                dgram.len(),
                dgram.source
            );
        }

        // Copy the destinations out so a slow send never holds up registration
        let dests = self.registry.snapshot();
        let payload = dgram.payload.clone();

        // The router holds the receiving end for its whole lifetime
        let _ = self.inspection.send(dgram);

        let mut delivered = 0;
        for dest in dests.iter() {
            match self.link.send_to(&payload, *dest) {
                Ok(_) => delivered += 1,
                Err(e) => warn!("Failed to forward telemetry to {dest}: {e}"),
            }
        }

        delivered
    }

    pub fn close(&mut self) {
        self.link.close();
    }
}
