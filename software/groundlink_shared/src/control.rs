//! Text protocol spoken on the router's control channel.
//!
//! Each request is one UDP datagram holding ASCII text with no length prefix
//! and no acknowledgment:
//!
//! * `<host>,<port>` subscribes `(host, port)` to telemetry fanout.
//! * `-<host>,<port>` removes the subscription for `port`.
//!
//! Hostnames and IP literals never begin with `-`, so the removal form
//! cannot be mistaken for a subscription.

use std::fmt;

/// A parsed control-channel request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    Subscribe { host: String, port: u16 },
    Unsubscribe { host: String, port: u16 },
}

/// Reasons a control datagram could not be understood
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlParseError {
    Empty,
    NotUtf8,
    MissingComma,
    TooManyFields,
    EmptyHost,
    BadPort(String),
}

impl fmt::Display for ControlParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty control request"),
            Self::NotUtf8 => write!(f, "control request is not valid UTF-8"),
            Self::MissingComma => write!(f, "expected `<host>,<port>`"),
            Self::TooManyFields => write!(f, "expected exactly two comma-separated fields"),
            Self::EmptyHost => write!(f, "host field is empty"),
            Self::BadPort(p) => write!(f, "invalid port `{p}`"),
        }
    }
}

impl std::error::Error for ControlParseError {}

impl ControlRequest {
    /// Parse a raw datagram payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ControlParseError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ControlParseError::NotUtf8)?;
        Self::parse(text)
    }

    /// Parse a request from text.
    pub fn parse(text: &str) -> Result<Self, ControlParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ControlParseError::Empty);
        }

        let (remove, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };

        let mut fields = body.split(',');
        let host = fields.next().unwrap_or_default().trim();
        let port = fields.next().ok_or(ControlParseError::MissingComma)?.trim();
        if fields.next().is_some() {
            return Err(ControlParseError::TooManyFields);
        }
        if host.is_empty() {
            return Err(ControlParseError::EmptyHost);
        }
        let port = match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(ControlParseError::BadPort(port.to_owned())),
            Ok(p) => p,
        };

        let host = host.to_owned();
        Ok(if remove {
            Self::Unsubscribe { host, port }
        } else {
            Self::Subscribe { host, port }
        })
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Subscribe { host, .. } | Self::Unsubscribe { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Subscribe { port, .. } | Self::Unsubscribe { port, .. } => *port,
        }
    }
}

/// Wire encoding, for clients sending requests to the router
impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe { host, port } => write!(f, "{host},{port}"),
            Self::Unsubscribe { host, port } => write!(f, "-{host},{port}"),
        }
    }
}
