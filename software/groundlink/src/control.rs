//! Control channel listener for subscriber registration.
//!
//! Runs on its own thread with a blocking receive. Requests are the text
//! datagrams defined in [`groundlink_shared::control`]; nothing is sent back.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use groundlink_shared::control::ControlRequest;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RouterError};
use crate::registry::AddressRegistry;
use crate::socket::{Datagram, UdpLink};

/// Upper bound on how long a receive blocks before the stop flag is
/// rechecked, in case the wake datagram sent on stop is lost.
const CONTROL_RECV_CEILING: Duration = Duration::from_secs(1);

/// Resolve a subscriber host, preferring IPv4 like the rest of the link.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| RouterError::Resolve {
            host: host.to_owned(),
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| RouterError::Resolve {
            host: host.to_owned(),
        })
}

/// Listener that applies subscribe/unsubscribe requests to the registry.
pub struct ControlChannel {
    link: UdpLink,
    registry: AddressRegistry,
    running: Arc<AtomicBool>,
}

impl ControlChannel {
    pub fn bind(
        addr: SocketAddr,
        registry: AddressRegistry,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let link = UdpLink::bind("control", addr, CONTROL_RECV_CEILING)?;
        Ok(Self {
            link,
            registry,
            running,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    /// Apply one request datagram to the registry.
    pub fn handle(&self, dgram: &Datagram) -> Result<ControlRequest> {
        let req = ControlRequest::from_bytes(dgram.payload())?;
        match &req {
            ControlRequest::Subscribe { host, port } => {
                let addr = resolve(host, *port)?;
                self.registry.insert(*port, addr);
            }
            ControlRequest::Unsubscribe { port, .. } => {
                self.registry.remove(*port)?;
            }
        }
        Ok(req)
    }

    /// Classify a receive error. After the running flag cleared it is the
    /// expected end of a shutdown; before, it is fatal and clears the flag.
    fn recv_failed(&self, e: RouterError) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            debug!("Control channel closed during shutdown: {e}");
            return Ok(());
        }
        error!("Control channel failed: {e}");
        self.running.store(false, Ordering::Release);
        Err(e)
    }

    /// Serve requests until the running flag clears.
    ///
    /// A socket error while still running is fatal and also clears the
    /// running flag so the rest of the router winds down; one seen after
    /// the flag cleared is the expected end of a shutdown.
    pub fn run(mut self) -> Result<()> {
        info!("Control channel listening on {:?}", self.link.local_addr());
        let result = loop {
            if !self.running.load(Ordering::Acquire) {
                break Ok(());
            }

            let dgram = match self.link.recv() {
                Ok(Some(dgram)) => dgram,
                Ok(None) => continue,
                Err(e) => break self.recv_failed(e),
            };

            // Wake-up datagrams from our own shutdown
            if !self.running.load(Ordering::Acquire) {
                break Ok(());
            }

            match self.handle(&dgram) {
                Ok(req) => debug!("Control request from {}: {req}", dgram.source),
                Err(e) => warn!("Ignored control request from {}: {e}", dgram.source),
            }
        };

        self.link.close();
        info!("Control channel stopped");
        result
    }
}

/// Join handle for a control channel running on its own thread.
pub struct ControlChannelHandle {
    addr: SocketAddr,
    thread: JoinHandle<Result<()>>,
}

impl ControlChannelHandle {
    pub fn spawn(channel: ControlChannel) -> Result<Self> {
        let addr = channel
            .local_addr()
            .ok_or_else(|| RouterError::Thread("control socket closed before start".to_owned()))?;
        let thread = Builder::new()
            .name("groundlink-control".to_owned())
            .spawn(move || channel.run())
            .map_err(|e| RouterError::Thread(format!("failed to spawn control thread: {e}")))?;
        Ok(Self { addr, thread })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Unblock the listener and wait for it to exit.
    /// The running flag must already be cleared.
    pub fn stop(self) -> Result<()> {
        let wake_target = match self.addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.addr.port()),
            IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), self.addr.port()),
            _ => self.addr,
        };
        let local = match wake_target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        // Best effort: the receive ceiling bounds the wait if this is lost
        if let Ok(sock) = UdpSocket::bind(local) {
            let _ = sock.send_to(&[], wake_target);
        }

        self.thread
            .join()
            .map_err(|_| RouterError::Thread("control thread panicked".to_owned()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn channel(registry: &AddressRegistry, running: &Arc<AtomicBool>) -> ControlChannel {
        ControlChannel::bind("127.0.0.1:0".parse().unwrap(), registry.clone(), running.clone())
            .unwrap()
    }

    fn src() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn handle_subscribe_and_unsubscribe() {
        let registry = AddressRegistry::new();
        let running = Arc::new(AtomicBool::new(true));
        let ctl = channel(&registry, &running);

        ctl.handle(&Datagram::new(b"127.0.0.1,9500".to_vec(), src())).unwrap();
        assert_eq!(registry.get(9500), Some("127.0.0.1:9500".parse().unwrap()));

        ctl.handle(&Datagram::new(b"-127.0.0.1,9500".to_vec(), src())).unwrap();
        assert!(registry.is_empty());

        assert!(matches!(
            ctl.handle(&Datagram::new(b"-127.0.0.1,9500".to_vec(), src())),
            Err(RouterError::UnknownTlmDest(9500))
        ));
        assert!(matches!(
            ctl.handle(&Datagram::new(b"garbage".to_vec(), src())),
            Err(RouterError::ControlParse(_))
        ));
    }

    #[test]
    fn resubscribe_replaces_host() {
        let registry = AddressRegistry::new();
        let running = Arc::new(AtomicBool::new(true));
        let ctl = channel(&registry, &running);

        ctl.handle(&Datagram::new(b"127.0.0.2,9500".to_vec(), src())).unwrap();
        ctl.handle(&Datagram::new(b"localhost,9500".to_vec(), src())).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(9500), Some("127.0.0.1:9500".parse().unwrap()));
    }

    fn os_error() -> RouterError {
        RouterError::socket("control", std::io::Error::from(std::io::ErrorKind::ConnectionAborted))
    }

    #[test]
    fn recv_error_while_running_is_fatal() {
        let registry = AddressRegistry::new();
        let running = Arc::new(AtomicBool::new(true));
        let ctl = channel(&registry, &running);

        let outcome = ctl.recv_failed(os_error());
        assert!(matches!(outcome, Err(RouterError::Socket { what: "control", .. })));
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn recv_error_after_stop_is_normal_exit() {
        let registry = AddressRegistry::new();
        let running = Arc::new(AtomicBool::new(false));
        let ctl = channel(&registry, &running);

        assert!(ctl.recv_failed(os_error()).is_ok());
        assert!(!running.load(Ordering::Acquire));
    }

    #[test]
    fn listener_registers_and_stops_promptly() {
        let registry = AddressRegistry::new();
        let running = Arc::new(AtomicBool::new(true));
        let handle = ControlChannelHandle::spawn(channel(&registry, &running)).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"127.0.0.1,9600", handle.local_addr()).unwrap();

        let start = Instant::now();
        while !registry.contains(9600) && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(registry.contains(9600));

        running.store(false, Ordering::Release);
        let start = Instant::now();
        handle.stop().unwrap();
        assert!(start.elapsed() <= CONTROL_RECV_CEILING + Duration::from_millis(200));
    }
}
