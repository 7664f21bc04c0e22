//! VPN/proxy detection for game servers.
//!
//! Classifies player addresses as VPN/proxy or clean using the cheapest
//! source that can answer, and applies a configurable policy to players
//! that are flagged.
//!
//! # Features
//!
//! - **Tiered lookups** - In-process cache, then SQLite, then the IPHub API
//! - **Single-flight** - Concurrent checks of one address share one API call
//! - **Freshness window** - Stored verdicts are re-checked after N days
//! - **Overrides** - Whitelisted addresses (with CIDR) and identities
//! - **Monitor/Enforce** - Notify only, or notify and enforce
//! - **Fail-open** - Source or store outages never flag a player
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   mode: monitor
//!
//! iphub:
//!   api_key: "${IPHUB_API_KEY}"
//!
//! store:
//!   path: "vpn-blocker.db"
//!   freshness_days: 180
//!
//! overrides:
//!   identities:
//!     - "76561198000000000"
//! ```

pub mod address;
pub mod cache;
pub mod config;
pub mod events;
pub mod overrides;
pub mod providers;
pub mod resolver;
pub mod session;
pub mod store;

pub use address::{is_locally_scoped, Key, KeyError};
pub use config::{Config, EnforcementMode};
pub use overrides::OverrideTable;
pub use providers::{Classification, ClassificationSource, Confidence, SourceError};
pub use resolver::{AuditTag, Resolution, Resolver, ResolverStats, Tier};
pub use session::{EnforceError, Enforcer, Notifier, SessionGuard, Trigger};
pub use store::{ReputationStore, SqliteStore, StoreError, StoreRecord};
