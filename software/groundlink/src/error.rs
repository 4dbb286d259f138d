//! Router error types

use std::io;
use std::net::SocketAddr;

use groundlink_shared::control::ControlParseError;
use thiserror::Error;

use crate::codec::CodecError;

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors surfaced by the router.
///
/// Timeouts are never errors. Registry mutation errors are reported to the
/// caller and logged but leave the router running; socket errors are fatal
/// to the routing loop.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Unable to bind or connect a socket at startup
    #[error("unable to bind {what} socket to {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Unable to configure a socket option (timeout, blocking mode)
    #[error("unable to configure {what} socket: {source}")]
    SocketOption {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// Unrecoverable I/O error during steady-state operation
    #[error("{what} socket failed: {source}")]
    Socket {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// Removal of a telemetry destination that was never registered
    #[error("no telemetry destination registered on port {0}")]
    UnknownTlmDest(u16),

    /// Removal of a command source that was never registered
    #[error("no command source registered on port {0}")]
    UnknownCmdSource(u16),

    /// A command source already exists on this port
    #[error("command source already registered on port {0}")]
    DuplicateCmdSource(u16),

    /// A host name in a subscription could not be resolved
    #[error("unable to resolve subscriber host `{host}`")]
    Resolve { host: String },

    #[error("router already started")]
    AlreadyStarted,

    #[error("router is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("thread error: {0}")]
    Thread(String),

    #[error("malformed control request: {0}")]
    ControlParse(#[from] ControlParseError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RouterError {
    /// Whether this error ends the routing loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::SocketOption { .. } | Self::Socket { .. } | Self::Thread(_)
        )
    }

    #[inline]
    pub(crate) fn socket(what: &'static str, source: io::Error) -> Self {
        Self::Socket { what, source }
    }

    #[inline]
    pub(crate) fn option(what: &'static str, source: io::Error) -> Self {
        Self::SocketOption { what, source }
    }
}
