//! Telemetry subscriber addresses shared between the control channel
//! (writer) and the routing loop (reader).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info};

use crate::error::{Result, RouterError};

/// Thread-safe map from subscriber port to subscriber address.
///
/// Every read and write holds the same mutex, so a snapshot either fully
/// includes or fully excludes a concurrent registration. Fanout copies the
/// snapshot out and releases the lock before sending.
#[derive(Clone, Default, Debug)]
pub struct AddressRegistry {
    inner: Arc<Mutex<BTreeMap<u16, SocketAddr>>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panicking writer cannot leave a half-written entry behind,
    /// so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u16, SocketAddr>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber keyed by `port`, replacing any previous address
    /// for that key. Returns the replaced address.
    pub fn insert(&self, port: u16, addr: SocketAddr) -> Option<SocketAddr> {
        let previous = self.lock().insert(port, addr);
        match previous {
            Some(old) if old != addr => {
                info!("Telemetry destination on port {port} moved from {old} to {addr}")
            }
            Some(_) => {}
            None => info!("Added telemetry destination {addr}"),
        }
        previous
    }

    /// Remove the subscriber keyed by `port`.
    pub fn remove(&self, port: u16) -> Result<SocketAddr> {
        match self.lock().remove(&port) {
            Some(addr) => {
                info!("Removed telemetry destination {addr}");
                Ok(addr)
            }
            None => {
                error!("Unable to remove telemetry destination: none registered on port {port}");
                Err(RouterError::UnknownTlmDest(port))
            }
        }
    }

    pub fn get(&self, port: u16) -> Option<SocketAddr> {
        self.lock().get(&port).copied()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.lock().contains_key(&port)
    }

    /// Copy out the current set of destination addresses.
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.lock().values().copied().collect()
    }

    /// Copy out the current port-to-address map.
    pub fn entries(&self) -> BTreeMap<u16, SocketAddr> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn reregistration_is_last_write_wins() {
        let reg = AddressRegistry::new();
        assert_eq!(reg.insert(9500, addr("10.0.0.1:9500")), None);
        assert_eq!(
            reg.insert(9500, addr("127.0.0.1:9500")),
            Some(addr("10.0.0.1:9500"))
        );

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot(), vec![addr("127.0.0.1:9500")]);
    }

    #[test]
    fn remove_unknown_port_is_reported() {
        let reg = AddressRegistry::new();
        reg.insert(9500, addr("127.0.0.1:9500"));

        assert!(matches!(reg.remove(9501), Err(RouterError::UnknownTlmDest(9501))));
        assert_eq!(reg.len(), 1);

        assert_eq!(reg.remove(9500).unwrap(), addr("127.0.0.1:9500"));
        assert!(reg.is_empty());
        assert!(reg.remove(9500).is_err());
    }

    #[test]
    fn snapshots_never_see_partial_entries() {
        let reg = AddressRegistry::new();
        let writer = {
            let reg = reg.clone();
            thread::spawn(move || {
                for port in 1000..3000_u16 {
                    reg.insert(port, SocketAddr::from(([127, 0, 0, 1], port)));
                }
            })
        };

        let mut last_len = 0;
        while !writer.is_finished() {
            let entries = reg.entries();
            // Entries only ever accumulate, and each one is whole
            assert!(entries.len() >= last_len);
            for (port, a) in entries.iter() {
                assert_eq!(a.port(), *port);
            }
            last_len = entries.len();
        }
        writer.join().unwrap();
        assert_eq!(reg.len(), 2000);
    }
}
