//! Metrics registry for the sync layer
//!
//! - Counters only
//! - Monotonic increase
//! - Reset only on process start
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for the sync pipeline
///
/// All counters use atomic operations for thread-safe increments.
/// Uses Relaxed ordering (eventual consistency is fine for metrics).
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Raw notifications taken off channels
    notifications_received: AtomicU64,
    /// Notifications on topics outside the routing table
    notifications_dropped: AtomicU64,
    /// Notifications with neither snapshot present
    notifications_empty: AtomicU64,
    /// Domain events handed to the dispatch bus
    events_published: AtomicU64,
    /// Events emitted with missing identity fields
    events_incomplete: AtomicU64,
    /// Callback errors and panics caught by the bus
    callback_failures: AtomicU64,
    /// Usage records written
    usage_log_writes: AtomicU64,
    /// Usage records lost
    usage_log_failures: AtomicU64,
    /// Authoritative refreshes attempted
    refreshes: AtomicU64,
    /// Refresh queries that failed
    refresh_failures: AtomicU64,
    /// Channel reconnect attempts
    reconnect_attempts: AtomicU64,
}

impl SyncMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Pipeline

    /// Increment notifications received
    pub fn increment_notifications_received(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment notifications dropped
    pub fn increment_notifications_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment notifications without snapshots
    pub fn increment_notifications_empty(&self) {
        self.notifications_empty.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment events published
    pub fn increment_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment incomplete events
    pub fn increment_events_incomplete(&self) {
        self.events_incomplete.fetch_add(1, Ordering::Relaxed);
    }

    /// Add callback failures from one publish
    pub fn add_callback_failures(&self, count: u64) {
        self.callback_failures.fetch_add(count, Ordering::Relaxed);
    }

    // Usage log

    /// Increment usage log writes
    pub fn increment_usage_log_writes(&self) {
        self.usage_log_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment usage log failures
    pub fn increment_usage_log_failures(&self) {
        self.usage_log_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Aggregates

    /// Increment refreshes
    pub fn increment_refreshes(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment refresh failures
    pub fn increment_refresh_failures(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Channels

    /// Increment reconnect attempts
    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all metrics
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            notifications_empty: self.notifications_empty.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_incomplete: self.events_incomplete.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            usage_log_writes: self.usage_log_writes.load(Ordering::Relaxed),
            usage_log_failures: self.usage_log_failures.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of all metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub notifications_received: u64,
    pub notifications_dropped: u64,
    pub notifications_empty: u64,
    pub events_published: u64,
    pub events_incomplete: u64,
    pub callback_failures: u64,
    pub usage_log_writes: u64,
    pub usage_log_failures: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub reconnect_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_registry_is_zero() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.snapshot(), SyncMetricsSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let metrics = SyncMetrics::new();
        metrics.increment_notifications_received();
        metrics.increment_notifications_received();
        metrics.add_callback_failures(3);
        metrics.increment_refresh_failures();

        let snap = metrics.snapshot();
        assert_eq!(snap.notifications_received, 2);
        assert_eq!(snap.callback_failures, 3);
        assert_eq!(snap.refresh_failures, 1);
        assert_eq!(snap.events_published, 0);
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(SyncMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    m.increment_events_published();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.snapshot().events_published, 1000);
    }
}
