//! Configuration of a router run
//! that may be used by each of the router's loops.

use std::default::Default;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

use groundlink_shared::CONTROL_PORT;

use crate::error::{Result, RouterError};

/// Router configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
#[non_exhaustive]
pub struct RouterCtx {
    /// Command-ingest address of the flight target.
    /// Fixed for the lifetime of the router.
    pub flight_cmd_addr: SocketAddr,

    /// Local address to bind the telemetry downlink, control channel,
    /// and command sources to
    pub ground_ip: IpAddr,

    /// Port on which the flight target sends telemetry.
    /// Port 0 lets the OS choose.
    pub tlm_port: u16,

    /// Receive timeout for the telemetry downlink and command sources
    /// in (fractional) seconds. Zero means pure nonblocking polling.
    pub recv_timeout_s: f64,

    /// Port for subscribe/unsubscribe requests.
    /// Port 0 lets the OS choose.
    pub control_port: u16,

    /// Host used for subscribers registered by port alone
    pub local_dest_host: IpAddr,

    /// Maximum number of datagrams taken from any one socket or queue
    /// per routing cycle, so a flood on one input cannot starve the others
    pub drain_limit: usize,

    /// Forward datagrams received on command sources to the flight target
    pub relay_cmd_sources: bool,

    /// A name for this run, used as the name of the log file
    pub op_name: String,

    /// A directory to place outputs.
    pub op_dir: PathBuf,

    /// Install the global logger when the router starts
    pub enable_logging: bool,

    /// Core to pin the routing loop to, if available
    pub core_assignment: Option<usize>,
}

impl Default for RouterCtx {
    fn default() -> Self {
        // Use current time with seconds as op name and use working directory as op dir,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            flight_cmd_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234),
            ground_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tlm_port: 1235,
            recv_timeout_s: 0.1,
            control_port: CONTROL_PORT,
            local_dest_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            drain_limit: 1024,
            relay_cmd_sources: true,
            op_name,
            op_dir: std::fs::canonicalize("./").unwrap_or_default(),
            enable_logging: true,
            core_assignment: None,
        }
    }
}

impl RouterCtx {
    /// Check for values that would make the router misbehave
    pub fn validate(&self) -> Result<()> {
        if Duration::try_from_secs_f64(self.recv_timeout_s).is_err() {
            return Err(RouterError::Config(format!(
                "receive timeout must be a representable, nonnegative number of seconds, got {}",
                self.recv_timeout_s
            )));
        }
        if self.drain_limit == 0 {
            return Err(RouterError::Config("drain limit must be nonzero".to_owned()));
        }
        Ok(())
    }

    /// Receive timeout as a duration. Invalid values read as zero.
    pub fn recv_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recv_timeout_s).unwrap_or(Duration::ZERO)
    }

    pub fn tlm_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ground_ip, self.tlm_port)
    }

    pub fn control_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ground_ip, self.control_port)
    }

    /// Load a configuration from a json file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| RouterError::Config(format!("unable to read {}: {e}", path.display())))?;
        let ctx: Self = serde_json::from_str(&text)
            .map_err(|e| RouterError::Config(format!("unable to parse {}: {e}", path.display())))?;
        ctx.validate()?;
        Ok(ctx)
    }

    /// Save the configuration as pretty-printed json.
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| RouterError::Config(format!("unable to serialize config: {e}")))?;
        fs::write(path, text)
            .map_err(|e| RouterError::Config(format!("unable to write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ser_roundtrip() {
        let mut ctx = RouterCtx::default();
        ctx.flight_cmd_addr = "10.0.0.2:1234".parse().unwrap();
        ctx.recv_timeout_s = 0.25;

        let serialized = serde_json::to_string(&ctx).unwrap();
        let deserialized = serde_json::from_str::<RouterCtx>(&serialized).unwrap();
        let reserialized = serde_json::to_string(&deserialized).unwrap();

        assert_eq!(serialized, reserialized);
        assert_eq!(deserialized.recv_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let ctx: RouterCtx =
            serde_json::from_str(r#"{"flight_cmd_addr": "192.168.1.50:1234", "tlm_port": 1235}"#)
                .unwrap();
        assert_eq!(ctx.control_port, CONTROL_PORT);
        assert_eq!(ctx.flight_cmd_addr, "192.168.1.50:1234".parse().unwrap());
        assert!(ctx.relay_cmd_sources);
    }

    #[test]
    fn validate_rejects_bad_timeouts() {
        let mut ctx = RouterCtx::default();
        ctx.recv_timeout_s = -1.0;
        assert!(matches!(ctx.validate(), Err(RouterError::Config(_))));
        ctx.recv_timeout_s = f64::NAN;
        assert!(ctx.validate().is_err());
        ctx.recv_timeout_s = f64::INFINITY;
        assert!(ctx.validate().is_err());
        // Finite but too large to be a Duration
        ctx.recv_timeout_s = 1e30;
        assert!(matches!(ctx.validate(), Err(RouterError::Config(_))));
        ctx.recv_timeout_s = 0.0;
        assert!(ctx.validate().is_ok());
        ctx.recv_timeout_s = 3600.0;
        assert!(ctx.validate().is_ok());
        assert_eq!(ctx.recv_timeout(), Duration::from_secs(3600));
        ctx.drain_limit = 0;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn json_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("groundlink_ctx_{}.json", std::process::id()));
        let mut ctx = RouterCtx::default();
        ctx.tlm_port = 4321;
        ctx.to_json_file(&path).unwrap();

        let loaded = RouterCtx::from_json_file(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded.tlm_port, 4321);
        assert_eq!(loaded.op_name, ctx.op_name);
    }
}
