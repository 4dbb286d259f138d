//! Router lifecycle and the client-facing handle.

mod routing_loop;

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::codec::{CommandEncoder, CommandKey, FieldValue, MessageDescriptor, TelemetryDecoder};
use crate::context::RouterCtx;
use crate::control::{ControlChannel, ControlChannelHandle};
use crate::error::{Result, RouterError};
use crate::fanout::TelemetryFanout;
use crate::logging::init_logging;
use crate::registry::AddressRegistry;
use crate::relay::CommandRelay;
use crate::socket::Datagram;
use crate::source::CommandSource;
use routing_loop::RoutingLoop;

/// State shared between the router, its handles, and its loops.
///
/// Command sources sit behind a mutex: callers on any thread bind and
/// insert or remove entries, and the routing loop holds the lock only
/// while it polls the sources without blocking.
struct Shared {
    running: Arc<AtomicBool>,
    finished: AtomicBool,
    registry: AddressRegistry,
    sources: Mutex<BTreeMap<u16, CommandSource>>,

    /// Receive error to raise on the next routing cycle
    #[cfg(test)]
    fault: Mutex<Option<std::io::ErrorKind>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            registry: AddressRegistry::new(),
            sources: Mutex::new(BTreeMap::new()),
            #[cfg(test)]
            fault: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn inject_fault(&self, kind: std::io::ErrorKind) {
        *self.fault.lock().unwrap() = Some(kind);
    }

    #[cfg(test)]
    fn injected_fault(&self) -> Result<()> {
        match self.fault.lock().unwrap().take() {
            Some(kind) => Err(RouterError::socket("telemetry downlink", kind.into())),
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    #[inline]
    fn injected_fault(&self) -> Result<()> {
        Ok(())
    }

    fn lock_sources(&self) -> MutexGuard<'_, BTreeMap<u16, CommandSource>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_sources(&self) {
        let mut sources = self.lock_sources();
        for source in sources.values_mut() {
            source.close();
        }
        sources.clear();
    }
}

/// Cloneable handle for everything a client of the router may do:
/// queue commands, read telemetry, and manage subscribers and command sources.
/// Clients never touch the router's sockets.
///
/// Clones share the same queues, so two handles reading telemetry
/// split the stream between them.
#[derive(Clone)]
pub struct RouterHandle {
    shared: Arc<Shared>,
    outbound: Sender<Vec<u8>>,
    inspection: Receiver<Datagram>,
    cmd_echo: Receiver<Datagram>,
    ground_ip: IpAddr,
    local_dest_host: IpAddr,
}

impl RouterHandle {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Ask both loops to stop. Returns immediately; the thread that owns the
    /// `Router` sees its `wait()` return and sockets are closed there.
    pub fn request_stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("Router stop requested");
        }
    }

    /// Queue an already-encoded command for the flight target.
    ///
    /// Commands queued before `start()` are relayed once the router runs.
    pub fn send_command(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        if self.shared.finished.load(Ordering::Acquire) {
            return Err(RouterError::NotRunning);
        }
        // The router keeps a receiver alive, so this cannot disconnect
        let _ = self.outbound.send(payload.into());
        Ok(())
    }

    /// Encode a command by name and queue it. Nothing is queued if encoding fails.
    pub fn send_encoded<E: CommandEncoder + ?Sized>(
        &self,
        encoder: &E,
        key: &CommandKey,
        fields: &[(String, FieldValue)],
    ) -> Result<()> {
        let payload = encoder.encode(key, fields)?;
        debug!("Encoded {key} into {} bytes", payload.len());
        self.send_command(payload)
    }

    /// Next telemetry frame from the inspection queue, waiting up to `timeout`.
    pub fn recv_telemetry(&self, timeout: Duration) -> Option<Datagram> {
        match self.inspection.recv_timeout(timeout) {
            Ok(dgram) => Some(dgram),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv_telemetry(&self) -> Option<Datagram> {
        self.inspection.try_recv().ok()
    }

    /// Next telemetry frame, decoded.
    ///
    /// A frame the decoder rejects is logged and discarded, returning `None`.
    pub fn recv_decoded<D: TelemetryDecoder + ?Sized>(
        &self,
        decoder: &D,
        timeout: Duration,
    ) -> Option<(MessageDescriptor, D::Message)> {
        let dgram = self.recv_telemetry(timeout)?;
        match decoder.decode(dgram.payload()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!("Unable to decode {} byte frame from {}: {e}", dgram.len(), dgram.source);
                None
            }
        }
    }

    /// Next datagram received on any command source, waiting up to `timeout`.
    pub fn recv_cmd_echo(&self, timeout: Duration) -> Option<Datagram> {
        self.cmd_echo.recv_timeout(timeout).ok()
    }

    /// Subscribe `(local_dest_host, port)` to telemetry.
    pub fn add_tlm_dest(&self, port: u16) -> SocketAddr {
        let addr = SocketAddr::new(self.local_dest_host, port);
        self.shared.registry.insert(port, addr);
        addr
    }

    /// Subscribe an arbitrary address to telemetry, keyed by its port.
    pub fn add_tlm_dest_addr(&self, addr: SocketAddr) {
        self.shared.registry.insert(addr.port(), addr);
    }

    /// Unsubscribe the destination on `port`.
    /// An unknown port is logged and reported, and changes nothing.
    pub fn remove_tlm_dest(&self, port: u16) -> Result<SocketAddr> {
        self.shared.registry.remove(port)
    }

    pub fn tlm_dests(&self) -> BTreeMap<u16, SocketAddr> {
        self.shared.registry.entries()
    }

    /// Bind a new command source on `(ground_ip, port)`.
    ///
    /// Returns the bound port, which differs from `port` only when `port` is 0.
    pub fn add_cmd_source(&self, port: u16) -> Result<u16> {
        if self.shared.finished.load(Ordering::Acquire) {
            return Err(RouterError::NotRunning);
        }
        if port != 0 && self.shared.lock_sources().contains_key(&port) {
            error!("Command source already registered on port {port}");
            return Err(RouterError::DuplicateCmdSource(port));
        }

        // Bind outside the lock so the routing loop is never held up by it
        let source = CommandSource::bind(self.ground_ip, port)?;
        let bound = source.port();

        let mut sources = self.shared.lock_sources();
        if sources.contains_key(&bound) {
            error!("Command source already registered on port {bound}");
            return Err(RouterError::DuplicateCmdSource(bound));
        }
        sources.insert(bound, source);
        info!("Added command source on port {bound}");
        Ok(bound)
    }

    /// Close and forget the command source on `port`.
    /// An unknown port is logged and reported, and changes nothing.
    pub fn remove_cmd_source(&self, port: u16) -> Result<()> {
        match self.shared.lock_sources().remove(&port) {
            Some(mut source) => {
                source.close();
                info!("Removed command source on port {port}");
                Ok(())
            }
            None => {
                error!("Unable to remove command source: none registered on port {port}");
                Err(RouterError::UnknownCmdSource(port))
            }
        }
    }

    pub fn cmd_sources(&self) -> Vec<u16> {
        self.shared.lock_sources().keys().copied().collect()
    }
}

/// Owns every socket and thread of the command/telemetry link
/// and is the single place they are started and stopped.
pub struct Router {
    ctx: RouterCtx,
    handle: RouterHandle,
    outbound_rx: Receiver<Vec<u8>>,
    inspection_tx: Sender<Datagram>,
    cmd_echo_tx: Sender<Datagram>,

    started: bool,
    tlm_addr: Option<SocketAddr>,
    control: Option<ControlChannelHandle>,
    routing: Option<JoinHandle<Result<()>>>,
    fatal: Option<RouterError>,
}

impl Router {
    pub fn new(ctx: RouterCtx) -> Self {
        let shared = Arc::new(Shared::new());
        let (outbound_tx, outbound_rx) = unbounded();
        let (inspection_tx, inspection_rx) = unbounded();
        let (cmd_echo_tx, cmd_echo_rx) = unbounded();

        let handle = RouterHandle {
            shared,
            outbound: outbound_tx,
            inspection: inspection_rx,
            cmd_echo: cmd_echo_rx,
            ground_ip: ctx.ground_ip,
            local_dest_host: ctx.local_dest_host,
        };

        Self {
            ctx,
            handle,
            outbound_rx,
            inspection_tx,
            cmd_echo_tx,
            started: false,
            tlm_addr: None,
            control: None,
            routing: None,
            fatal: None,
        }
    }

    pub fn ctx(&self) -> &RouterCtx {
        &self.ctx
    }

    /// A handle for client code. Handles outlive the router safely;
    /// once it has shut down their queues simply run dry.
    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Shared subscriber registry.
    pub fn registry(&self) -> &AddressRegistry {
        &self.handle.shared.registry
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn flight_cmd_addr(&self) -> SocketAddr {
        self.ctx.flight_cmd_addr
    }

    /// Bound telemetry downlink address, once started
    pub fn tlm_addr(&self) -> Option<SocketAddr> {
        self.tlm_addr
    }

    /// Bound control channel address, once started
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.as_ref().map(|c| c.local_addr())
    }

    /// Open the flight command socket, bind the telemetry downlink and
    /// control channel, and launch the control and routing threads.
    ///
    /// A router runs at most once; restarting means building a new one.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(RouterError::AlreadyStarted);
        }
        self.ctx.validate()?;
        self.started = true;

        if self.ctx.enable_logging {
            let log_path = init_logging(&self.ctx.op_dir, &self.ctx.op_name)?;
            info!("Logging to {}", log_path.display());
        }

        let shared = &self.handle.shared;
        let relay = CommandRelay::open(self.ctx.flight_cmd_addr, self.outbound_rx.clone())?;
        let fanout = TelemetryFanout::bind(
            self.ctx.tlm_bind_addr(),
            self.ctx.recv_timeout(),
            shared.registry.clone(),
            self.inspection_tx.clone(),
        )?;
        let control = ControlChannel::bind(
            self.ctx.control_bind_addr(),
            shared.registry.clone(),
            Arc::clone(&shared.running),
        )?;
        self.tlm_addr = fanout.local_addr();

        shared.running.store(true, Ordering::Release);

        let control = match ControlChannelHandle::spawn(control) {
            Ok(control) => control,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.control = Some(control);

        let routing = RoutingLoop {
            fanout,
            relay,
            shared: Arc::clone(shared),
            outbound: self.handle.outbound.clone(),
            cmd_echo: self.cmd_echo_tx.clone(),
            drain_limit: self.ctx.drain_limit,
            relay_cmd_sources: self.ctx.relay_cmd_sources,
            core_assignment: self.ctx.core_assignment,
        };
        let spawned = Builder::new()
            .name("groundlink-router".to_owned())
            .spawn(move || routing.run());
        match spawned {
            Ok(thread) => self.routing = Some(thread),
            Err(e) => {
                let err = RouterError::Thread(format!("failed to spawn routing thread: {e}"));
                let _ = self.shutdown();
                return Err(err);
            }
        }

        info!(
            "Router started: commands to {}, telemetry on {:?}, control on {:?}",
            self.ctx.flight_cmd_addr,
            self.tlm_addr,
            self.control_addr()
        );
        Ok(())
    }

    /// Block until the routing loop exits, then shut everything down.
    /// Returns the error that ended the loop, if any.
    pub fn wait(&mut self) -> Result<()> {
        self.join_routing();
        self.shutdown()
    }

    fn join_routing(&mut self) {
        if let Some(thread) = self.routing.take() {
            let outcome = thread
                .join()
                .unwrap_or_else(|_| Err(RouterError::Thread("routing thread panicked".to_owned())));
            if let Err(e) = outcome {
                self.fatal.get_or_insert(e);
            }
        }
    }

    /// Stop both loops and close every socket.
    ///
    /// Safe to call repeatedly and from any state. Returns the error that
    /// ended the routing loop or control channel, if there was one, on the
    /// first call that observes it.
    pub fn shutdown(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.handle.shared);
        let was_running = shared.running.swap(false, Ordering::AcqRel);

        self.join_routing();
        if let Some(control) = self.control.take() {
            if let Err(e) = control.stop() {
                self.fatal.get_or_insert(e);
            }
        }
        shared.close_sources();

        if self.started && !shared.finished.swap(true, Ordering::AcqRel) {
            info!("Router shut down");
        } else if was_running {
            debug!("Router stopped");
        }

        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn send_command(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.handle.send_command(payload)
    }

    pub fn recv_telemetry(&self, timeout: Duration) -> Option<Datagram> {
        self.handle.recv_telemetry(timeout)
    }

    pub fn add_tlm_dest(&self, port: u16) -> SocketAddr {
        self.handle.add_tlm_dest(port)
    }

    pub fn remove_tlm_dest(&self, port: u16) -> Result<SocketAddr> {
        self.handle.remove_tlm_dest(port)
    }

    pub fn add_cmd_source(&self, port: u16) -> Result<u16> {
        self.handle.add_cmd_source(port)
    }

    pub fn remove_cmd_source(&self, port: u16) -> Result<()> {
        self.handle.remove_cmd_source(port)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Router stopped with error: {e}");
        }
    }
}
