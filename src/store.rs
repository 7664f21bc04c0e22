//! SQLite-backed persistent cache of classifications.
//!
//! One row per address; every write overwrites the previous verdict and its
//! timestamp (last writer wins). Reads apply the freshness window, expired
//! rows are simply ignored and eventually overwritten.

use crate::providers::{Classification, Confidence};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

const SCHEMA_SQL: &str = "
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS vpn_addresses (
    ip_address TEXT PRIMARY KEY NOT NULL,
    flagged    INTEGER NOT NULL,
    severity   INTEGER,
    identity   TEXT NOT NULL DEFAULT '',
    label      TEXT NOT NULL DEFAULT '',
    checked_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vpn_addresses_checked_at ON vpn_addresses (checked_at);
";

/// Errors from the persistent cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A previous holder of the connection panicked.
    #[error("connection lock poisoned")]
    Poisoned,

    /// The blocking task running the query failed.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Stored row could not be decoded.
    #[error("corrupt row for {ip}: {details}")]
    Corrupt { ip: String, details: String },
}

/// A persisted classification together with its audit context.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub ip: IpAddr,
    pub classification: Classification,
    /// Identity that triggered the lookup.
    pub identity: String,
    /// Display name at lookup time.
    pub label: String,
    pub checked_at: DateTime<Utc>,
}

impl StoreRecord {
    /// Age of the record relative to `now`; zero for future timestamps.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.checked_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Durable address → classification store.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    /// Newest record for `ip` no older than `max_age`.
    async fn lookup(&self, ip: &IpAddr, max_age: Duration)
        -> Result<Option<StoreRecord>, StoreError>;

    /// Insert or overwrite the record for `record.ip`.
    async fn upsert(&self, record: &StoreRecord) -> Result<(), StoreError>;
}

/// `SQLite` implementation of [`ReputationStore`].
///
/// Queries run on tokio's blocking pool; the connection is shared behind a
/// mutex so concurrent writers serialize at the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Non-durable store, used for tests and as a fallback when the file
    /// cannot be opened.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Row for `ip` regardless of age.
    pub async fn get(&self, ip: &IpAddr) -> Result<Option<StoreRecord>, StoreError> {
        let ip = ip.to_string();
        self.with_conn(move |conn| select_record(conn, &ip, None)).await
    }

    /// Number of stored addresses.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM vpn_addresses", [], |r| r.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl ReputationStore for SqliteStore {
    async fn lookup(
        &self,
        ip: &IpAddr,
        max_age: Duration,
    ) -> Result<Option<StoreRecord>, StoreError> {
        let ip = ip.to_string();
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .map(|t| t.timestamp())
            .unwrap_or(i64::MIN);

        self.with_conn(move |conn| select_record(conn, &ip, Some(cutoff)))
            .await
    }

    async fn upsert(&self, record: &StoreRecord) -> Result<(), StoreError> {
        let ip = record.ip.to_string();
        let flagged = record.classification.flagged;
        let severity = record.classification.severity.map(i64::from);
        let identity = record.identity.clone();
        let label = record.label.clone();
        let checked_at = record.checked_at.timestamp();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO vpn_addresses (ip_address, flagged, severity, identity, label, checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(ip_address) DO UPDATE SET
                     flagged = excluded.flagged,
                     severity = excluded.severity,
                     identity = excluded.identity,
                     label = excluded.label,
                     checked_at = excluded.checked_at",
                params![ip, flagged, severity, identity, label, checked_at],
            )?;
            Ok(())
        })
        .await
    }
}

fn select_record(
    conn: &Connection,
    ip: &str,
    min_checked_at: Option<i64>,
) -> Result<Option<StoreRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT flagged, severity, identity, label, checked_at
             FROM vpn_addresses
             WHERE ip_address = ?1 AND checked_at >= ?2
             LIMIT 1",
            params![ip, min_checked_at.unwrap_or(i64::MIN)],
            |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((flagged, severity, identity, label, checked_at)) = row else {
        return Ok(None);
    };

    let corrupt = |details: String| StoreError::Corrupt {
        ip: ip.to_string(),
        details,
    };

    let parsed_ip = ip
        .parse::<IpAddr>()
        .map_err(|e| corrupt(format!("address: {}", e)))?;
    let severity = severity
        .map(u8::try_from)
        .transpose()
        .map_err(|e| corrupt(format!("severity: {}", e)))?;
    let checked_at = Utc
        .timestamp_opt(checked_at, 0)
        .single()
        .ok_or_else(|| corrupt(format!("timestamp {}", checked_at)))?;

    Ok(Some(StoreRecord {
        ip: parsed_ip,
        classification: Classification {
            flagged,
            severity,
            confidence: Confidence::High,
        },
        identity,
        label,
        checked_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86400);

    fn record(ip: &str, flagged: bool, days_old: i64) -> StoreRecord {
        let classification = if flagged {
            Classification::flagged().with_severity(1)
        } else {
            Classification::clean().with_severity(0)
        };
        StoreRecord {
            ip: ip.parse().unwrap(),
            classification,
            identity: "76561198000000001".to_string(),
            label: "Player".to_string(),
            checked_at: Utc::now() - chrono::Duration::days(days_old),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("1.2.3.4", true, 0);

        store.upsert(&rec).await.unwrap();

        let found = store
            .lookup(&rec.ip, 180 * DAY)
            .await
            .unwrap()
            .expect("fresh row");
        assert!(found.classification.flagged);
        assert_eq!(found.classification.severity, Some(1));
        assert_eq!(found.identity, "76561198000000001");
        assert_eq!(found.label, "Player");
        assert_eq!(found.checked_at.timestamp(), rec.checked_at.timestamp());
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let store = SqliteStore::in_memory().unwrap();
        let ip: IpAddr = "9.9.9.9".parse().unwrap();
        assert!(store.lookup(&ip, DAY).await.unwrap().is_none());
        assert!(store.get(&ip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_row_is_ignored_but_kept() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = record("1.2.3.4", true, 200);
        store.upsert(&rec).await.unwrap();

        assert!(store.lookup(&rec.ip, 180 * DAY).await.unwrap().is_none());
        assert!(store.get(&rec.ip).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_single_row() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(&record("1.2.3.4", true, 200)).await.unwrap();

        let mut newer = record("1.2.3.4", false, 0);
        newer.identity = "76561198000000002".to_string();
        store.upsert(&newer).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let found = store.lookup(&newer.ip, DAY).await.unwrap().unwrap();
        assert!(!found.classification.flagged);
        assert_eq!(found.identity, "76561198000000002");
    }

    #[tokio::test]
    async fn test_ipv6_and_missing_severity() {
        let store = SqliteStore::in_memory().unwrap();
        let mut rec = record("2001:db8::1", false, 0);
        rec.classification = Classification::clean();
        store.upsert(&rec).await.unwrap();

        let found = store.get(&rec.ip).await.unwrap().unwrap();
        assert_eq!(found.ip, rec.ip);
        assert!(found.classification.severity.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_one_row() {
        let store = SqliteStore::in_memory().unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(&record("5.6.7.8", i % 2 == 0, 0)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn.db");
        let rec = record("1.2.3.4", true, 1);

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert(&rec).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let found = reopened.lookup(&rec.ip, 180 * DAY).await.unwrap().unwrap();
        assert!(found.classification.flagged);
    }

    #[test]
    fn test_record_age() {
        let rec = record("1.2.3.4", false, 2);
        let age = rec.age(Utc::now());
        assert!(age >= 2 * DAY && age < 3 * DAY);

        let mut future = rec.clone();
        future.checked_at = Utc::now() + chrono::Duration::days(1);
        assert_eq!(future.age(Utc::now()), Duration::ZERO);
    }
}
