//! The main routing loop, run on its own thread.
//!
//! Each cycle drains the telemetry downlink (bounded by the receive
//! timeout), relays queued commands to the flight target, then polls every
//! command source without blocking.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam::channel::Sender;
use tracing::{error, info, warn};

use super::Shared;
use crate::error::Result;
use crate::fanout::TelemetryFanout;
use crate::relay::CommandRelay;
use crate::socket::Datagram;

pub(super) struct RoutingLoop {
    pub(super) fanout: TelemetryFanout,
    pub(super) relay: CommandRelay,
    pub(super) shared: Arc<Shared>,
    pub(super) outbound: Sender<Vec<u8>>,
    pub(super) cmd_echo: Sender<Datagram>,
    pub(super) drain_limit: usize,
    pub(super) relay_cmd_sources: bool,
    pub(super) core_assignment: Option<usize>,
}

impl RoutingLoop {
    /// Run until the running flag clears or a socket fails,
    /// then close every socket the loop touches.
    pub(super) fn run(mut self) -> Result<()> {
        pin_thread(self.core_assignment);

        info!("Entering routing loop");
        let result = loop {
            if !self.shared.running.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.cycle() {
                error!("Routing loop failed: {e}");
                break Err(e);
            }
        };

        // Also tells the control channel to stop if we are exiting on an error
        self.shared.running.store(false, Ordering::Release);
        self.fanout.close();
        self.relay.close();
        self.shared.close_sources();
        info!("Routing loop stopped");

        result
    }

    fn cycle(&mut self) -> Result<()> {
        self.shared.injected_fault()?;
        self.fanout.drain(self.drain_limit)?;
        self.relay.relay_pending(self.drain_limit);

        let outbound = self.relay_cmd_sources.then_some(&self.outbound);
        let mut sources = self.shared.lock_sources();
        for source in sources.values_mut() {
            source.drain(self.drain_limit, &self.cmd_echo, outbound)?;
        }
        Ok(())
    }
}

#[cfg(feature = "affinity")]
fn pin_thread(core: Option<usize>) {
    let Some(id) = core else {
        return;
    };
    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
        warn!("Unable to pin routing loop to core {id}");
    }
    let _ = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max);
}

#[cfg(not(feature = "affinity"))]
fn pin_thread(core: Option<usize>) {
    if let Some(id) = core {
        warn!("Core assignment {id} ignored; built without the `affinity` feature");
    }
}
