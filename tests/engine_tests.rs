//! End-to-end tests for the write-behind engine
//!
//! Exercises create/resolve, the hit-recording path and the reconciler
//! together over the in-process fast store and a SQLite durable store.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use snaplink::cache::LayeredCache;
use snaplink::fast::{FastStore, KeyKind, MemoryFastStore};
use snaplink::keys;
use snaplink::models::{SyncStatus, VisitorInfo};
use snaplink::reconciler::Reconciler;
use snaplink::services::analytics_service::AnalyticsTtls;
use snaplink::services::link_service::CreateLinkRequest;
use snaplink::services::{AnalyticsService, LinkService};
use snaplink::storage::DurableStorage;

struct TestEngine {
    fast: Arc<dyn FastStore>,
    storage: Arc<DurableStorage>,
    links: LinkService,
    analytics: AnalyticsService,
    reconciler: Reconciler,
    _dir: TempDir,
}

async fn engine() -> TestEngine {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("engine_test.db").display()
    );
    let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new());
    let storage = Arc::new(
        DurableStorage::new(&db_url, 5, Duration::from_secs(2))
            .await
            .expect("failed to open sqlite store"),
    );
    let cache = Arc::new(LayeredCache::new(fast.clone()));

    TestEngine {
        links: LinkService::new(fast.clone(), storage.clone(), 86_400),
        analytics: AnalyticsService::new(
            fast.clone(),
            storage.clone(),
            cache,
            AnalyticsTtls::default(),
        ),
        reconciler: Reconciler::new(fast.clone(), storage.clone(), 100, 86_400, 86_400),
        fast,
        storage,
        _dir: dir,
    }
}

fn create(code: Option<&str>, topic: Option<&str>) -> CreateLinkRequest {
    CreateLinkRequest {
        owner_id: "u1".to_string(),
        long_url: "https://a.example".to_string(),
        custom_code: code.map(str::to_string),
        topic: topic.map(str::to_string),
    }
}

fn visitor(ip: &str, os: &str, device: &str) -> VisitorInfo {
    VisitorInfo {
        visitor_ip: ip.to_string(),
        os_type: Some(os.to_string()),
        device_type: Some(device.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_resolve_drain_lands_durable_row() {
    let engine = engine().await;

    let link = engine
        .links
        .create_link(CreateLinkRequest {
            owner_id: "u1".to_string(),
            long_url: "https://a.example".to_string(),
            custom_code: Some("abc".to_string()),
            topic: None,
        })
        .await
        .unwrap();
    assert_eq!(link.sync_status, SyncStatus::Pending);

    // Read-your-writes before any reconciliation
    assert_eq!(engine.links.resolve("abc").await.unwrap(), "https://a.example");

    engine.reconciler.process_pending_links().await.unwrap();

    let row = engine.storage.get_link("abc").await.unwrap().unwrap();
    assert_eq!(row.long_url, "https://a.example");
    assert_eq!(row.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn hit_recording_survives_counter_eviction() {
    let engine = engine().await;
    engine.links.create_link(create(Some("abc"), None)).await.unwrap();
    engine.reconciler.process_pending_links().await.unwrap();

    for i in 0..120 {
        engine
            .analytics
            .record_hit("abc", visitor(&format!("10.0.{}.{}", i / 256, i % 256), "Linux", "desktop"))
            .await
            .unwrap();
    }
    engine.reconciler.process_pending_visits().await.unwrap();

    // Simulate counter eviction; the durable ledger restores both values
    engine.fast.del(&keys::total_clicks("abc")).await.unwrap();
    engine.fast.del(&keys::unique_visitors("abc")).await.unwrap();

    let counts = engine.analytics.read_counts("abc").await.unwrap();
    assert_eq!(counts.total_clicks, 120);
    let error = (counts.unique_visitors as f64 - 120.0).abs() / 120.0;
    assert!(error <= 0.02, "unique estimate off by {:.3}", error);
}

#[tokio::test]
async fn visit_facts_drain_idempotently() {
    let engine = engine().await;
    for i in 0..5 {
        engine
            .analytics
            .record_hit("abc", visitor(&format!("10.9.0.{i}"), "Linux", "desktop"))
            .await
            .unwrap();
    }

    engine.reconciler.process_pending_visits().await.unwrap();
    // Second drain with an empty ledger changes nothing
    assert_eq!(engine.reconciler.process_pending_visits().await.unwrap(), 0);
    assert_eq!(
        engine
            .storage
            .count_visits(&["abc".to_string()])
            .await
            .unwrap(),
        5
    );
}

#[tokio::test]
async fn topic_aggregate_rolls_up_all_links() {
    let engine = engine().await;
    engine
        .links
        .create_link(create(Some("one"), Some("launch")))
        .await
        .unwrap();
    engine
        .links
        .create_link(create(Some("two"), Some("launch")))
        .await
        .unwrap();
    engine.reconciler.process_pending_links().await.unwrap();

    for i in 0..4 {
        engine
            .analytics
            .record_hit("one", visitor(&format!("10.3.0.{i}"), "Linux", "desktop"))
            .await
            .unwrap();
    }
    for i in 0..2 {
        engine
            .analytics
            .record_hit("two", visitor(&format!("10.3.1.{i}"), "macOS", "mobile"))
            .await
            .unwrap();
    }
    engine.reconciler.process_pending_visits().await.unwrap();

    let aggregate = engine.analytics.topic_aggregate("launch").await.unwrap();
    assert_eq!(aggregate.total_clicks, 6);
    assert_eq!(aggregate.unique_visitors, 6);
    assert_eq!(aggregate.links.len(), 2);
    let one = aggregate.links.iter().find(|l| l.code == "one").unwrap();
    assert_eq!(one.total_clicks, 4);
    assert!(!aggregate.clicks_by_date.is_empty());
}

#[tokio::test]
async fn owner_aggregate_includes_breakdowns() {
    let engine = engine().await;
    engine.links.create_link(create(Some("one"), None)).await.unwrap();
    engine.links.create_link(create(Some("two"), None)).await.unwrap();
    engine.reconciler.process_pending_links().await.unwrap();

    engine
        .analytics
        .record_hit("one", visitor("10.4.0.1", "Linux", "desktop"))
        .await
        .unwrap();
    engine
        .analytics
        .record_hit("two", visitor("10.4.0.2", "Windows", "desktop"))
        .await
        .unwrap();
    engine.reconciler.process_pending_visits().await.unwrap();

    let aggregate = engine.analytics.owner_aggregate("u1").await.unwrap();
    assert_eq!(aggregate.total_links, 2);
    assert_eq!(aggregate.total_clicks, 2);
    assert_eq!(aggregate.unique_visitors, 2);
    assert_eq!(aggregate.os_stats.len(), 2);
    let desktop = aggregate
        .device_stats
        .iter()
        .find(|row| row.name == "desktop")
        .unwrap();
    assert_eq!(desktop.clicks, 2);
}

#[tokio::test]
async fn aggregates_refresh_by_ttl_only() {
    let engine = engine().await;
    engine
        .links
        .create_link(create(Some("one"), Some("launch")))
        .await
        .unwrap();
    engine.reconciler.process_pending_links().await.unwrap();
    engine
        .analytics
        .record_hit("one", visitor("10.5.0.1", "Linux", "desktop"))
        .await
        .unwrap();
    engine.reconciler.process_pending_visits().await.unwrap();

    let before = engine.analytics.topic_aggregate("launch").await.unwrap();
    assert_eq!(before.total_clicks, 1);

    // New durable activity does not invalidate the cached rollup
    engine
        .analytics
        .record_hit("one", visitor("10.5.0.2", "Linux", "desktop"))
        .await
        .unwrap();
    engine.reconciler.process_pending_visits().await.unwrap();

    let after = engine.analytics.topic_aggregate("launch").await.unwrap();
    assert_eq!(after.total_clicks, 1);
}

#[tokio::test]
async fn failed_payload_never_blocks_healthy_entries() {
    let engine = engine().await;
    engine.links.create_link(create(Some("good"), None)).await.unwrap();
    // A ledger entry whose staged payload was evicted
    engine.fast.sadd(keys::PENDING_LINKS, "gone").await.unwrap();

    engine.reconciler.process_pending_links().await.unwrap();

    assert!(engine.storage.get_link("good").await.unwrap().is_some());
    // The broken entry stays for the cleanup pass
    let pending = engine.fast.smembers(keys::PENDING_LINKS).await.unwrap();
    assert_eq!(pending, vec!["gone".to_string()]);

    engine.reconciler.cleanup_expired().await.unwrap();
    assert!(engine.fast.smembers(keys::PENDING_LINKS).await.unwrap().is_empty());
    assert_eq!(
        engine.fast.key_type(&keys::link("good")).await.unwrap(),
        KeyKind::Hash
    );
}
