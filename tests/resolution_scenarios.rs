//! End-to-end lookups against a mocked IPHub and a real SQLite store.

use chrono::Utc;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vpn_blocker::config::{IpHubConfig, Settings};
use vpn_blocker::providers::iphub::IpHubProvider;
use vpn_blocker::{
    AuditTag, Classification, Confidence, EnforceError, EnforcementMode, Enforcer, Key, Notifier,
    OverrideTable, ReputationStore, Resolver, SessionGuard, SqliteStore, StoreRecord, Tier,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DAY: Duration = Duration::from_secs(86400);

fn iphub_config(server: &MockServer) -> IpHubConfig {
    IpHubConfig {
        enabled: true,
        api_key: "test-key".to_string(),
        url_template: format!("{}/ip/{{ip}}", server.uri()),
        flag_threshold: 1,
        timeout_ms: 2000,
    }
}

async fn mock_iphub(body: serde_json::Value, expected_calls: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ip/8.8.8.8"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expected_calls)
        .mount(&server)
        .await;
    server
}

fn resolver(server: &MockServer, store: &SqliteStore) -> Arc<Resolver> {
    let source = IpHubProvider::new(iphub_config(server)).unwrap();
    Arc::new(Resolver::new(
        Arc::new(store.clone()),
        Arc::new(source),
        180 * DAY,
        100,
    ))
}

#[tokio::test]
async fn test_flagged_answer_is_stored_then_served_from_memory() {
    let server = mock_iphub(serde_json::json!({ "ip": "8.8.8.8", "block": 80 }), 1).await;
    let store = SqliteStore::in_memory().unwrap();
    let resolver = resolver(&server, &store);
    let key = Key::parse("8.8.8.8:27005").unwrap();
    let audit = AuditTag::new("S1", "Alice");

    let first = resolver.resolve(&key, &audit).await;
    assert_eq!(first.tier, Tier::Source);
    assert!(first.classification.flagged);
    assert_eq!(first.classification.severity, Some(80));

    let second = resolver.resolve(&key, &audit).await;
    assert_eq!(second.tier, Tier::Memory);
    assert_eq!(second.classification, first.classification);

    let ip: IpAddr = "8.8.8.8".parse().unwrap();
    let row = store.get(&ip).await.unwrap().unwrap();
    assert!(row.classification.flagged);
    assert_eq!(row.identity, "S1");
    assert_eq!(row.label, "Alice");
}

#[tokio::test]
async fn test_persisted_verdict_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("vpn.db");
    let key = Key::parse("8.8.8.8").unwrap();
    let audit = AuditTag::new("S1", "Alice");

    {
        let server = mock_iphub(serde_json::json!({ "block": 1 }), 1).await;
        let store = SqliteStore::open(&db).unwrap();
        let resolution = resolver(&server, &store).resolve(&key, &audit).await;
        assert_eq!(resolution.tier, Tier::Source);
    }

    // Fresh process: no memory tier, source must not be hit.
    let server = mock_iphub(serde_json::json!({ "block": 0 }), 0).await;
    let store = SqliteStore::open(&db).unwrap();
    let resolution = resolver(&server, &store).resolve(&key, &audit).await;
    assert_eq!(resolution.tier, Tier::Store);
    assert!(resolution.classification.flagged);
}

#[tokio::test]
async fn test_stale_row_with_malformed_answer_fails_open() {
    let store = SqliteStore::in_memory().unwrap();
    let ip: IpAddr = "8.8.8.8".parse().unwrap();
    let stale_at = Utc::now() - chrono::Duration::days(181);
    store
        .upsert(&StoreRecord {
            ip,
            classification: Classification::from_severity(80, 1),
            identity: "S1".to_string(),
            label: "Alice".to_string(),
            checked_at: stale_at,
        })
        .await
        .unwrap();

    let server = mock_iphub(serde_json::json!({ "ip": "8.8.8.8" }), 1).await;
    let resolver = resolver(&server, &store);
    let resolution = resolver
        .resolve(&Key::from(ip), &AuditTag::new("S2", "Bob"))
        .await;

    assert_eq!(resolution.tier, Tier::Fallback);
    assert!(!resolution.classification.flagged);
    assert_eq!(resolution.classification.confidence, Confidence::Low);

    // Fallbacks are never written back.
    let row = store.get(&ip).await.unwrap().unwrap();
    assert_eq!(row.identity, "S1");
    assert_eq!(row.checked_at.timestamp(), stale_at.timestamp());
    assert_eq!(resolver.stats().source_failures, 1);
}

#[derive(Default)]
struct Recorder {
    enforced: Mutex<Vec<String>>,
    notified: Mutex<Vec<String>>,
}

impl Enforcer for Recorder {
    fn enforce(&self, identity: &str) -> Result<(), EnforceError> {
        self.enforced.lock().unwrap().push(identity.to_string());
        Ok(())
    }
}

impl Notifier for Recorder {
    fn notify(&self, identity: &str, _key: &Key, _message: &str) {
        self.notified.lock().unwrap().push(identity.to_string());
    }
}

fn guard(server: &MockServer, mode: EnforcementMode, recorder: &Arc<Recorder>) -> Arc<SessionGuard> {
    let store = SqliteStore::in_memory().unwrap();
    let settings = Settings {
        mode,
        ..Settings::default()
    };
    SessionGuard::new(
        resolver(server, &store),
        Arc::new(OverrideTable::new()),
        Arc::clone(recorder) as Arc<dyn Enforcer>,
        Arc::clone(recorder) as Arc<dyn Notifier>,
        &settings,
    )
}

#[tokio::test]
async fn test_enforce_mode_connect_enforces_flagged_player() {
    let server = mock_iphub(serde_json::json!({ "block": 1 }), 1).await;
    let recorder = Arc::new(Recorder::default());
    let guard = guard(&server, EnforcementMode::Enforce, &recorder);

    guard
        .on_connect("S1", "Alice", "8.8.8.8:27005")
        .unwrap()
        .await
        .unwrap();

    assert!(guard.is_flagged("S1"));
    assert_eq!(*recorder.notified.lock().unwrap(), vec!["S1".to_string()]);
    assert_eq!(*recorder.enforced.lock().unwrap(), vec!["S1".to_string()]);
}

#[tokio::test]
async fn test_monitor_then_enforce_acts_on_flagged_session() {
    let server = mock_iphub(serde_json::json!({ "block": 1 }), 1).await;
    let recorder = Arc::new(Recorder::default());
    let guard = guard(&server, EnforcementMode::Monitor, &recorder);

    guard
        .on_connect("S1", "Alice", "8.8.8.8")
        .unwrap()
        .await
        .unwrap();
    assert!(recorder.enforced.lock().unwrap().is_empty());

    for handle in guard.set_mode(EnforcementMode::Enforce) {
        handle.await.unwrap();
    }
    assert_eq!(*recorder.enforced.lock().unwrap(), vec!["S1".to_string()]);
}

#[tokio::test]
async fn test_local_player_never_reaches_source() {
    let server = mock_iphub(serde_json::json!({ "block": 1 }), 0).await;
    let recorder = Arc::new(Recorder::default());
    let guard = guard(&server, EnforcementMode::Enforce, &recorder);

    assert!(guard.on_connect("S1", "Alice", "192.168.1.20:27005").is_none());
    assert!(guard.on_connect("S2", "Bob", "127.0.0.1").is_none());
    assert_eq!(guard.tracked(), 2);
    assert!(recorder.notified.lock().unwrap().is_empty());
}
