//! # Sync Service
//!
//! Wires the channel registry, normalizer, aggregate store, activity feed,
//! dispatch bus and usage logger into one service object.
//!
//! ## Pipeline
//!
//! Every channel task forwards into one ingest queue. A single pump task
//! drains it and, per notification: normalizes, applies to the aggregates,
//! pushes to the feed, publishes on the bus and queues a usage record. The
//! pump is the only writer for the live path.
//!
//! ## Lifecycle
//!
//! `Idle -> Initializing -> Running -> Destroyed`. A failed `initialize`
//! tears down what it opened and returns to `Idle`. `Destroyed` is final.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::observability::{Event, SyncMetrics, SyncMetricsSnapshot};
use crate::realtime::aggregate::{AggregateSnapshot, AggregateStore, RefreshOutcome};
use crate::realtime::change::RawChangeNotification;
use crate::realtime::channel::{ChannelRegistry, NotificationHandler};
use crate::realtime::dispatcher::{CallbackError, CallbackToken, DispatchBus};
use crate::realtime::errors::{SyncError, SyncResult};
use crate::realtime::event::{DomainEvent, EventKind};
use crate::realtime::feed::ActivityFeed;
use crate::realtime::normalizer::Normalizer;
use crate::realtime::source::ChangeSource;
use crate::realtime::stats::StatsSource;
use crate::realtime::subscription::{ChannelKey, ChannelStatus};
use crate::realtime::usage::{UsageLogger, UsageSink};

/// Service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Initializing,
    Running,
    Destroyed,
}

impl ServiceState {
    /// Returns the state name
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "idle",
            ServiceState::Initializing => "initializing",
            ServiceState::Running => "running",
            ServiceState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate numbers for the dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeStats {
    pub active_users: u64,
    pub today_interactions: u64,
    pub online_users: Vec<String>,
}

impl From<&AggregateSnapshot> for RealtimeStats {
    fn from(snapshot: &AggregateSnapshot) -> Self {
        Self {
            active_users: snapshot.active_users_today,
            today_interactions: snapshot.today_interactions,
            online_users: snapshot.online_users.clone(),
        }
    }
}

/// What the monitor view should show. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MonitorStatus {
    /// Not initialized, destroyed, or no channel currently active
    NotConnected,
    /// Connected but nothing has arrived yet
    WaitingForEvents,
    /// Events are flowing
    Live { last_event_at: DateTime<Utc> },
}

/// Builder for [`SyncService`]
#[derive(Default)]
pub struct SyncServiceBuilder {
    config: Option<SyncConfig>,
    source: Option<Arc<dyn ChangeSource>>,
    stats: Option<Arc<dyn StatsSource>>,
    usage: Option<Arc<dyn UsageSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncServiceBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Service configuration (default: `SyncConfig::default()`)
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Change-data-capture transport (required)
    pub fn source<S: ChangeSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Authoritative stats backend (required)
    pub fn stats<S: StatsSource + 'static>(mut self, stats: S) -> Self {
        self.stats = Some(Arc::new(stats));
        self
    }

    /// Usage-log sink (required)
    pub fn usage_sink<S: UsageSink + 'static>(mut self, sink: S) -> Self {
        self.usage = Some(Arc::new(sink));
        self
    }

    /// Clock (default: system clock)
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Validate and assemble the service
    pub fn build(self) -> SyncResult<SyncService> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let source = self
            .source
            .ok_or_else(|| SyncError::Config("change source is required".into()))?;
        let stats = self
            .stats
            .ok_or_else(|| SyncError::Config("stats source is required".into()))?;
        let usage = self
            .usage
            .ok_or_else(|| SyncError::Config("usage sink is required".into()))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let metrics = Arc::new(SyncMetrics::new());

        let inner = ServiceInner {
            registry: ChannelRegistry::new(source, config.reconnect.clone(), Arc::clone(&metrics)),
            normalizer: Normalizer::new(Arc::clone(&clock)),
            aggregates: AggregateStore::new(
                stats,
                Arc::clone(&clock),
                config.online_window(),
                Arc::clone(&metrics),
            ),
            feed: ActivityFeed::new(config.feed_capacity),
            bus: DispatchBus::new(),
            usage: UsageLogger::new(usage, config.component_id.clone(), Arc::clone(&metrics)),
            metrics,
            config,
            state: RwLock::new(ServiceState::Idle),
            ingest: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        };

        Ok(SyncService {
            inner: Arc::new(inner),
        })
    }
}

struct ServiceInner {
    config: SyncConfig,
    registry: ChannelRegistry,
    normalizer: Normalizer,
    aggregates: AggregateStore,
    feed: ActivityFeed,
    bus: DispatchBus,
    usage: UsageLogger,
    metrics: Arc<SyncMetrics>,
    state: RwLock<ServiceState>,
    /// Sender side of the pump's queue while it runs
    ingest: Mutex<Option<mpsc::UnboundedSender<RawChangeNotification>>>,
    /// Ingest pump and refresh timer
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceInner {
    fn state(&self) -> ServiceState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ServiceState::Destroyed)
    }

    /// Live path is open while initializing so early rows are not lost
    fn accepts_events(&self) -> bool {
        matches!(
            self.state(),
            ServiceState::Initializing | ServiceState::Running
        )
    }

    fn set_state(&self, next: ServiceState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    /// Run one notification through the pipeline
    fn process(&self, notification: &RawChangeNotification) {
        if !self.accepts_events() {
            return;
        }
        self.metrics.increment_notifications_received();
        if notification.is_empty() {
            self.metrics.increment_notifications_empty();
            warn!(event = %Event::NotificationEmpty, topic = %notification.topic, operation = %notification.operation, "notification has no row snapshot");
        }

        let events = match self.normalizer.normalize(notification) {
            Ok(events) => events,
            Err(e) => {
                self.metrics.increment_notifications_dropped();
                warn!(event = %Event::NotificationDropped, topic = %notification.topic, error = %e, "notification dropped");
                return;
            }
        };

        for event in events {
            if event.is_incomplete() {
                self.metrics.increment_events_incomplete();
                debug!(event = %Event::EventIncomplete, topic = %event.topic, kind = %event.kind(), "event missing identity fields");
            }

            self.aggregates.apply(&event);
            self.feed.push(event.clone());

            let result = self.bus.publish(&event);
            if result.failed > 0 {
                self.metrics.add_callback_failures(result.failed as u64);
            }
            self.metrics.increment_events_published();

            self.usage.record(&event);
        }
    }

    fn stop_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Queue a notification for the pump
    fn enqueue(&self, notification: RawChangeNotification) -> bool {
        if !self.accepts_events() {
            return false;
        }
        match self.ingest.lock() {
            Ok(ingest) => ingest
                .as_ref()
                .map(|tx| tx.send(notification).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Close channels, then stop the pump and the refresh timer
    fn teardown(&self) {
        self.registry.unsubscribe(None);
        if let Ok(mut ingest) = self.ingest.lock() {
            ingest.take();
        }
        self.stop_tasks();
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Realtime sync service
///
/// Cheap to clone; clones share one service.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncService")
            .field("state", &self.inner.state())
            .field("channels", &self.inner.registry.len())
            .field("callbacks", &self.inner.bus.len())
            .finish()
    }
}

impl SyncService {
    /// Start building a service
    pub fn builder() -> SyncServiceBuilder {
        SyncServiceBuilder::new()
    }

    /// Open every configured channel and start the pump and refresh timer.
    ///
    /// Waits for each channel to confirm, bounded by `subscribe_timeout`.
    /// Calling this on a running service is a no-op.
    pub async fn initialize(&self) -> SyncResult<()> {
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;

        {
            let mut state = self
                .inner
                .state
                .write()
                .map_err(|_| SyncError::Internal("Lock poisoned".into()))?;
            match *state {
                ServiceState::Running => return Ok(()),
                ServiceState::Destroyed => return Err(SyncError::Destroyed),
                ServiceState::Initializing => {
                    return Err(SyncError::Internal("initialize already in progress".into()))
                }
                ServiceState::Idle => *state = ServiceState::Initializing,
            }
        }

        let keys = self.inner.config.channel_keys();
        info!(event = %Event::InitializeBegin, channels = keys.len(), "initializing sync service");

        let (tx, rx) = mpsc::unbounded_channel::<RawChangeNotification>();
        let pump = runtime.spawn(run_pump(Arc::downgrade(&self.inner), rx));
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(pump);
        }
        if let Ok(mut ingest) = self.inner.ingest.lock() {
            *ingest = Some(tx.clone());
        }

        let handler: NotificationHandler = Arc::new(move |notification| {
            let _ = tx.send(notification);
        });

        let result = self.open_channels(keys, handler).await;

        match result {
            Ok(()) => {
                let mut state = self
                    .inner
                    .state
                    .write()
                    .map_err(|_| SyncError::Internal("Lock poisoned".into()))?;
                if *state == ServiceState::Destroyed {
                    return Err(SyncError::Destroyed);
                }
                *state = ServiceState::Running;
                drop(state);

                let timer = runtime.spawn(run_refresh(
                    Arc::downgrade(&self.inner),
                    self.inner.config.refresh_interval(),
                ));
                if let Ok(mut tasks) = self.inner.tasks.lock() {
                    tasks.push(timer);
                }

                info!(event = %Event::InitializeComplete, channels = self.inner.registry.len(), "sync service running");
                Ok(())
            }
            Err(e) => {
                error!(event = %Event::InitializeFailed, code = e.code(), error = %e, "initialize failed");
                if self.inner.state() == ServiceState::Destroyed {
                    return Err(SyncError::Destroyed);
                }
                self.inner.teardown();
                self.inner.set_state(ServiceState::Idle);
                Err(e)
            }
        }
    }

    async fn open_channels(
        &self,
        keys: Vec<ChannelKey>,
        handler: NotificationHandler,
    ) -> SyncResult<()> {
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            handles.push(self.inner.registry.subscribe(key, Arc::clone(&handler))?);
        }

        let timeout = self.inner.config.subscribe_timeout();
        let results = join_all(handles.iter().map(|h| h.wait_active(timeout))).await;
        results.into_iter().collect::<SyncResult<Vec<()>>>()?;
        Ok(())
    }

    /// Register a callback for one event kind
    pub fn on_sync<F>(&self, kind: EventKind, callback: F) -> CallbackToken
    where
        F: Fn(&DomainEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, callback)
    }

    /// Deregister a callback; returns false if it was already gone
    pub fn off_sync(&self, token: &CallbackToken) -> bool {
        self.inner.bus.off(token)
    }

    /// Dashboard numbers, refreshing from the stats source when stale.
    ///
    /// Never fails: with no refreshed snapshot and a failing source the
    /// zeroed default is returned.
    pub async fn get_realtime_stats(&self) -> RealtimeStats {
        if self.inner.state() == ServiceState::Destroyed {
            return RealtimeStats::default();
        }

        let max_age = ChronoDuration::from_std(self.inner.config.refresh_interval())
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        if self.inner.aggregates.is_stale(max_age) {
            let outcome = self.inner.aggregates.refresh().await;
            if outcome == RefreshOutcome::Failed && self.inner.aggregates.refreshed_at().is_none() {
                return RealtimeStats::default();
            }
        }

        RealtimeStats::from(&self.inner.aggregates.snapshot())
    }

    /// Force an authoritative refresh now
    pub async fn refresh(&self) -> RefreshOutcome {
        self.inner.aggregates.refresh().await
    }

    /// Full aggregate snapshot, without refreshing
    pub fn aggregates(&self) -> AggregateSnapshot {
        self.inner.aggregates.snapshot()
    }

    /// Latest events, newest first
    pub fn recent_activity(&self) -> Vec<DomainEvent> {
        self.inner.feed.recent()
    }

    /// Connection state for the monitor view
    pub fn monitor_status(&self) -> MonitorStatus {
        if self.inner.state() != ServiceState::Running || self.inner.registry.active_count() == 0 {
            return MonitorStatus::NotConnected;
        }
        match self.inner.feed.last_event_at() {
            Some(last_event_at) => MonitorStatus::Live { last_event_at },
            None => MonitorStatus::WaitingForEvents,
        }
    }

    /// Queue a notification for the pump as if a channel delivered it.
    ///
    /// Returns false when the service is idle or destroyed.
    pub fn ingest(&self, notification: RawChangeNotification) -> bool {
        self.inner.enqueue(notification)
    }

    /// Status of one channel
    pub fn channel_status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        self.inner.registry.status(key)
    }

    /// Keys with a live subscription
    pub fn channels(&self) -> Vec<ChannelKey> {
        self.inner.registry.keys()
    }

    /// Counter snapshot
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Wait for queued usage records to be written
    pub async fn flush_usage(&self) {
        self.inner.usage.flush().await;
    }

    /// Tear everything down. Idempotent; the service cannot be reused.
    ///
    /// Order: close channels, stop the ingest pump, stop the refresh timer,
    /// clear the bus.
    pub fn destroy(&self) {
        {
            let Ok(mut state) = self.inner.state.write() else {
                return;
            };
            if *state == ServiceState::Destroyed {
                return;
            }
            *state = ServiceState::Destroyed;
        }

        info!(event = %Event::DestroyBegin, channels = self.inner.registry.len(), "destroying sync service");
        self.inner.teardown();
        self.inner.bus.clear();
        info!(event = %Event::DestroyComplete, "sync service destroyed");
    }
}

/// Drain the ingest queue until the service is gone
async fn run_pump(inner: Weak<ServiceInner>, mut rx: mpsc::UnboundedReceiver<RawChangeNotification>) {
    while let Some(notification) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.process(&notification);
    }
    debug!("ingest pump stopped");
}

/// Periodic authoritative refresh; the first tick fires immediately
async fn run_refresh(inner: Weak<ServiceInner>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let outcome = inner.aggregates.refresh().await;
        debug!(?outcome, "periodic refresh");
    }
}
