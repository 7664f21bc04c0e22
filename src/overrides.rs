//! Static exemptions checked before any lookup.

use crate::config::OverrideConfig;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Rejected override input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    #[error("invalid address or network: {0}")]
    InvalidAddress(String),
    #[error("identity must not be blank")]
    BlankIdentity,
}

/// Exempt address entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl AddressEntry {
    /// Parse a single address or CIDR network.
    pub fn parse(s: &str) -> Result<Self, OverrideError> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            Ok(AddressEntry::Single(ip.to_canonical()))
        } else if let Ok(net) = s.parse::<IpNet>() {
            Ok(AddressEntry::Network(net.trunc()))
        } else {
            Err(OverrideError::InvalidAddress(s.to_string()))
        }
    }

    /// Check if an IP address matches this entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            AddressEntry::Single(addr) => addr == ip,
            AddressEntry::Network(net) => net.contains(ip),
        }
    }
}

impl std::fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressEntry::Single(ip) => write!(f, "{}", ip),
            AddressEntry::Network(net) => write!(f, "{}", net),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    addresses: Vec<AddressEntry>,
    identities: BTreeSet<String>,
}

/// Exempt addresses and identities, shared by every resolution.
///
/// Mutations only change memory; callers persist through
/// [`OverrideTable::snapshot`] and [`crate::Config::save`].
#[derive(Debug, Default)]
pub struct OverrideTable {
    inner: RwLock<Tables>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration, skipping entries that do not parse.
    pub fn from_config(config: &OverrideConfig) -> Self {
        let table = Self::new();
        table.replace(config);
        table
    }

    /// Replace all entries (config reload).
    pub fn replace(&self, config: &OverrideConfig) {
        let addresses = config
            .addresses
            .iter()
            .filter_map(|s| AddressEntry::parse(s).ok())
            .collect();
        let identities = config
            .identities
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        *self.write() = Tables {
            addresses,
            identities,
        };
    }

    pub fn contains_ip(&self, ip: &IpAddr) -> bool {
        self.read().addresses.iter().any(|entry| entry.contains(ip))
    }

    pub fn contains_identity(&self, identity: &str) -> bool {
        self.read().identities.contains(identity)
    }

    /// Either the identity or the address is exempt.
    pub fn exempts(&self, identity: &str, ip: &IpAddr) -> bool {
        self.contains_identity(identity) || self.contains_ip(ip)
    }

    /// Add an address or network. Returns false if already present.
    pub fn add_ip(&self, entry: &str) -> Result<bool, OverrideError> {
        let entry = AddressEntry::parse(entry)?;
        let mut tables = self.write();
        if tables.addresses.contains(&entry) {
            return Ok(false);
        }
        tables.addresses.push(entry);
        Ok(true)
    }

    /// Remove an address or network. Returns false if it was not present.
    pub fn remove_ip(&self, entry: &str) -> Result<bool, OverrideError> {
        let entry = AddressEntry::parse(entry)?;
        let mut tables = self.write();
        let before = tables.addresses.len();
        tables.addresses.retain(|e| e != &entry);
        Ok(tables.addresses.len() != before)
    }

    /// Add an identity. Returns false if already present.
    pub fn add_identity(&self, identity: &str) -> Result<bool, OverrideError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(OverrideError::BlankIdentity);
        }
        Ok(self.write().identities.insert(identity.to_string()))
    }

    /// Remove an identity. Returns false if it was not present.
    pub fn remove_identity(&self, identity: &str) -> bool {
        self.write().identities.remove(identity.trim())
    }

    /// Current contents in configuration form.
    pub fn snapshot(&self) -> OverrideConfig {
        let tables = self.read();
        OverrideConfig {
            addresses: tables.addresses.iter().map(ToString::to_string).collect(),
            identities: tables.identities.iter().cloned().collect(),
        }
    }

    // A poisoned table is still structurally valid
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
