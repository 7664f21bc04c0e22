//! Address normalization and local-scope classification.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Rejected address input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Nothing left after trimming.
    #[error("empty address")]
    Empty,
    /// Not an IPv4/IPv6 address, with or without a port.
    #[error("invalid address: {0:?}")]
    Invalid(String),
}

/// A normalized client address (no port).
///
/// IPv4-mapped IPv6 addresses are folded to their IPv4 form so that
/// `::ffff:1.2.3.4` and `1.2.3.4` share cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(IpAddr);

impl Key {
    /// Parse a raw address as reported by the host.
    ///
    /// Accepts `a.b.c.d`, `a.b.c.d:port`, bare IPv6, `[v6]` and `[v6]:port`.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }

        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self::from(ip));
        }

        if let Ok(sock) = raw.parse::<SocketAddr>() {
            return Ok(Self::from(sock.ip()));
        }

        if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            if let Ok(ip) = inner.parse::<IpAddr>() {
                return Ok(Self::from(ip));
            }
        }

        Err(KeyError::Invalid(raw.to_string()))
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// Whether this address is exempt from lookups.
    pub fn is_locally_scoped(&self) -> bool {
        is_locally_scoped(&self.0)
    }
}

impl From<IpAddr> for Key {
    fn from(ip: IpAddr) -> Self {
        Key(ip.to_canonical())
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::parse(s)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Loopback, RFC 1918 private ranges and IPv6 unique-local (fc00::/7).
pub fn is_locally_scoped(ip: &IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}
