//! Datagram sockets owned by the router's loops.

pub mod udp;

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use groundlink_shared::{MIN_TELEMETRY_LEN, PrimaryHeader};

pub use udp::UdpLink;

/// A received datagram along with where and when it arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
    pub time: Instant,
}

impl Datagram {
    pub fn new(payload: Vec<u8>, source: SocketAddr) -> Self {
        Self {
            payload,
            source,
            time: Instant::now(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Long enough to be forwarded as a telemetry frame
    pub fn is_telemetry_frame(&self) -> bool {
        self.payload.len() >= MIN_TELEMETRY_LEN
    }

    /// CCSDS primary header at the front of the payload, if there is room for one
    pub fn header(&self) -> Option<PrimaryHeader> {
        PrimaryHeader::parse(&self.payload)
    }
}

/// Receive errors that only mean "nothing arrived this cycle".
pub(crate) fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Receive errors reporting an ICMP unreachable for an earlier send.
/// The socket itself is still healthy.
pub(crate) fn is_send_echo(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
