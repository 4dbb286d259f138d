#![doc = include_str!("../README.md")]

pub mod codec;
pub mod context;
pub mod control;
pub mod error;
pub mod fanout;
mod logging;
pub mod registry;
pub mod relay;
pub mod router;
pub mod socket;
pub mod source;

pub use context::RouterCtx;
pub use error::{Result, RouterError};
pub use registry::AddressRegistry;
pub use router::{Router, RouterHandle};
pub use socket::Datagram;

pub use groundlink_shared::{CONTROL_PORT, MIN_TELEMETRY_LEN};
