//! Channel Recovery Tests
//!
//! Subscription lifecycle against a flaky change source:
//! - Replacing a subscription leaves exactly one stream open
//! - Lost connections are retried with backoff
//! - The circuit breaker pauses, then probes once
//! - Filtered channels only deliver matching rows

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use mobile_sync::observability::SyncMetrics;
use mobile_sync::realtime::{
    ChannelKey, ChannelRegistry, ChannelStatus, ColumnFilter, EventKind, MemoryChangeSource,
    MemoryStatsSource, MemoryUsageLog, NotificationHandler, RawChangeNotification,
    ReconnectPolicy, TransportError,
};
use mobile_sync::{SyncConfig, SyncService};

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay_ms: 5,
        max_delay_ms: 20,
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: 3,
        circuit_cooldown_secs: None,
    }
}

fn counting() -> (NotificationHandler, Arc<Mutex<usize>>) {
    let count = Arc::new(Mutex::new(0));
    let c = Arc::clone(&count);
    let handler: NotificationHandler = Arc::new(move |_| *c.lock().unwrap() += 1);
    (handler, count)
}

// =============================================================================
// Registry Tests
// =============================================================================

/// Subscribing twice to the same key keeps one live subscription and stream.
#[tokio::test]
async fn test_resubscribe_keeps_one_stream() {
    let source = MemoryChangeSource::new();
    let registry = ChannelRegistry::new(
        Arc::new(source.clone()),
        fast_policy(),
        Arc::new(SyncMetrics::new()),
    );

    for _ in 0..3 {
        let (handler, _) = counting();
        let handle = registry.subscribe(ChannelKey::new("likes"), handler).unwrap();
        handle.wait_active(Duration::from_secs(1)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(registry.len(), 1);
    assert_eq!(source.open_count("likes"), 1);

    assert_eq!(registry.unsubscribe(None), 1);
    assert_eq!(registry.unsubscribe(None), 0);
}

/// A half-open probe after the cooldown restores the channel.
#[tokio::test]
async fn test_circuit_breaker_probe_recovers() {
    let source = MemoryChangeSource::new();
    source.fail_next_opens(2);
    let policy = ReconnectPolicy {
        max_attempts: 2,
        circuit_cooldown_secs: Some(1),
        ..fast_policy()
    };
    let metrics = Arc::new(SyncMetrics::new());
    let registry = ChannelRegistry::new(Arc::new(source.clone()), policy, Arc::clone(&metrics));

    let (handler, _) = counting();
    let handle = registry.subscribe(ChannelKey::new("comments"), handler).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.status(), ChannelStatus::Reconnecting);
    assert_eq!(source.open_attempts(), 2);

    handle.wait_active(Duration::from_secs(3)).await.unwrap();
    assert_eq!(source.open_attempts(), 3);
    assert_eq!(metrics.snapshot().reconnect_attempts, 2);
}

/// Without a cooldown the channel fails for good once attempts run out.
#[tokio::test]
async fn test_channel_fails_without_cooldown() {
    let source = MemoryChangeSource::new();
    let registry = ChannelRegistry::new(
        Arc::new(source.clone()),
        fast_policy(),
        Arc::new(SyncMetrics::new()),
    );
    let (handler, _) = counting();
    let key = ChannelKey::new("users");
    let handle = registry.subscribe(key.clone(), handler).unwrap();
    handle.wait_active(Duration::from_secs(1)).await.unwrap();

    source.fail_next_opens(10);
    source.fail_topic("users", TransportError::ConnectionLost("network down".into()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(registry.status(&key), Some(ChannelStatus::Failed));
    assert_eq!(source.open_attempts(), 3);
}

// =============================================================================
// Service-Level Tests
// =============================================================================

/// A server hang-up is retried and delivery resumes without re-initializing.
#[tokio::test]
async fn test_service_recovers_from_dropped_channel() {
    let source = MemoryChangeSource::new();
    let config = SyncConfig {
        reconnect: fast_policy(),
        ..SyncConfig::default()
    };
    let service = SyncService::builder()
        .config(config)
        .source(source.clone())
        .stats(MemoryStatsSource::new())
        .usage_sink(MemoryUsageLog::new())
        .build()
        .unwrap();
    service.initialize().await.unwrap();

    let seen = Arc::new(Mutex::new(0));
    let c = Arc::clone(&seen);
    let _ = service.on_sync(EventKind::ContentInteraction, move |_| {
        *c.lock().unwrap() += 1;
        Ok(())
    });

    source.drop_topic("likes");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        service.channel_status(&ChannelKey::new("likes")),
        Some(ChannelStatus::Active)
    );

    assert_eq!(
        source.emit(RawChangeNotification::insert(
            "likes",
            json!({"user_id": "u1", "character_id": "c1"}),
        )),
        1
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(service.metrics().reconnect_attempts, 1);

    service.destroy();
}

/// A filtered channel ignores rows outside its predicate.
#[tokio::test]
async fn test_filtered_topic() {
    let source = MemoryChangeSource::new();
    let config = SyncConfig::from_json(
        r#"{"topics": [{"topic": "likes", "filter": {"column": "user_id", "value": "u1"}}]}"#,
    )
    .unwrap();
    let service = SyncService::builder()
        .config(config)
        .source(source.clone())
        .stats(MemoryStatsSource::new())
        .usage_sink(MemoryUsageLog::new())
        .build()
        .unwrap();
    service.initialize().await.unwrap();
    assert_eq!(service.channels().len(), 1);

    let mine = RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"}));
    let theirs = RawChangeNotification::insert("likes", json!({"user_id": "u2", "character_id": "c1"}));
    assert_eq!(source.emit(mine), 1);
    assert_eq!(source.emit(theirs), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.metrics().events_published, 1);

    service.destroy();
}

/// Filters compare the column's string form.
#[test]
fn test_filter_matching() {
    let filter = ColumnFilter::eq("character_id", "42");
    assert!(filter.matches(&RawChangeNotification::insert("likes", json!({"character_id": 42}))));
    assert!(!filter.matches(&RawChangeNotification::insert("likes", json!({"character_id": "7"}))));
}
