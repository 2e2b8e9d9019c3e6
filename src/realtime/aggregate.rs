//! # Aggregate Store
//!
//! Running counters and the online-user set shown on the monitor view.
//!
//! Live domain events adjust the numbers incrementally; a periodic refresh
//! against the `StatsSource` overwrites them with authoritative values.
//! Counters are per calendar day (UTC) and reset when the clock crosses
//! midnight.
//!
//! The state lock is only held for in-memory updates, never across a
//! backend query, so `snapshot()` never waits on a refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::change::Operation;
use super::event::{DomainEvent, EventPayload, InteractionType};
use super::presence::OnlineUsers;
use super::stats::{ComponentQuery, StatsQueryKind, StatsSource, ANALYTICS_COMPONENT};
use crate::clock::Clock;
use crate::observability::{Event, SyncMetrics};

/// Per-type interaction counters for the current day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCounters {
    pub likes: u64,
    pub comments: u64,
    pub follows: u64,
    pub plays: u64,
    pub views: u64,
    pub shares: u64,
}

impl InteractionCounters {
    fn bump(&mut self, interaction: InteractionType) {
        match interaction {
            InteractionType::Like => self.likes += 1,
            InteractionType::Comment => self.comments += 1,
            InteractionType::Follow => self.follows += 1,
            InteractionType::Play => self.plays += 1,
            InteractionType::View => self.views += 1,
            InteractionType::Share => self.shares += 1,
            InteractionType::Unknown => {}
        }
    }

    /// Sum of all counters
    pub fn total(&self) -> u64 {
        self.likes + self.comments + self.follows + self.plays + self.views + self.shares
    }
}

/// Point-in-time copy of the aggregates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Calendar day the counters belong to
    pub day: NaiveDate,
    pub active_users_today: u64,
    pub today_interactions: u64,
    pub interactions: InteractionCounters,
    /// Sorted user ids inside the online window
    pub online_users: Vec<String>,
    /// Last refresh that applied at least one authoritative value
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Result of one refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Every query answered and was applied
    Applied,
    /// Some queries failed; their fields kept last-known-good values
    Partial { failed: usize },
    /// Every query failed; nothing changed
    Failed,
    /// The day changed while the queries ran; day counters were not applied
    Outdated,
    /// Another refresh was already running
    Skipped,
}

#[derive(Debug)]
struct AggregateState {
    day: NaiveDate,
    active_users_today: u64,
    today_interactions: u64,
    interactions: InteractionCounters,
    online: OnlineUsers,
    refreshed_at: Option<DateTime<Utc>>,
}

impl AggregateState {
    fn new(day: NaiveDate, window: Duration) -> Self {
        Self {
            day,
            active_users_today: 0,
            today_interactions: 0,
            interactions: InteractionCounters::default(),
            online: OnlineUsers::new(window),
            refreshed_at: None,
        }
    }

    /// Reset the day counters if `now` is on a later day. Earlier instants
    /// never move the day back.
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today <= self.day {
            return;
        }
        info!(event = %Event::DayRollover, from = %self.day, to = %today, "day changed; resetting counters");
        self.day = today;
        self.active_users_today = 0;
        self.today_interactions = 0;
        self.interactions = InteractionCounters::default();
        self.online.cleanup(now);
    }
}

/// Clears the refresh flag when the refresh ends, including on cancel
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Derived real-time aggregates
pub struct AggregateStore {
    state: Mutex<AggregateState>,
    stats: Arc<dyn StatsSource>,
    clock: Arc<dyn Clock>,
    metrics: Arc<SyncMetrics>,
    refreshing: AtomicBool,
}

impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("refreshing", &self.refreshing.load(Ordering::Relaxed))
            .finish()
    }
}

impl AggregateStore {
    /// Create a store with zeroed counters for the clock's current day
    pub fn new(
        stats: Arc<dyn StatsSource>,
        clock: Arc<dyn Clock>,
        online_window: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let day = clock.now().date_naive();
        Self {
            state: Mutex::new(AggregateState::new(day, online_window)),
            stats,
            clock,
            metrics,
            refreshing: AtomicBool::new(false),
        }
    }

    /// Apply one live event
    pub fn apply(&self, event: &DomainEvent) {
        let now = self.clock.now();
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.roll_day(now);
        state.online.cleanup(now);

        match &event.payload {
            EventPayload::UserActivity(activity) => {
                state.today_interactions += 1;
                if let Some(user) = &activity.user_id {
                    state.online.mark(user, now);
                }
            }
            EventPayload::ContentInteraction(interaction) => {
                state.today_interactions += 1;
                state.interactions.bump(interaction.interaction_type);
                if let Some(user) = &interaction.user_id {
                    state.online.mark(user, now);
                }
            }
            EventPayload::AccountChange(change) if change.change == Operation::Insert => {
                state.active_users_today += 1;
            }
            // Echoes duplicate the ContentInteraction already counted.
            EventPayload::RealtimeInteraction(_)
            | EventPayload::AccountChange(_)
            | EventPayload::CreationActivity(_)
            | EventPayload::MembershipActivity(_) => {}
        }
    }

    /// Query the stats source and overwrite every field that answered
    pub async fn refresh(&self) -> RefreshOutcome {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!("refresh already running; skipped");
            return RefreshOutcome::Skipped;
        }
        let _guard = RefreshGuard(&self.refreshing);

        let now = self.clock.now();
        let today = now.date_naive();
        let window = self
            .state
            .lock()
            .map(|s| s.online.window())
            .unwrap_or_else(|_| Duration::minutes(5));

        self.metrics.increment_refreshes();

        let active_query = ComponentQuery::active_users(today);
        let interactions_query = ComponentQuery::interactions(today);
        let online_query = ComponentQuery::online_users(now - window);
        let (active, interactions, online) = tokio::join!(
            self.stats.get_component_data(ANALYTICS_COMPONENT, &active_query),
            self.stats.get_component_data(ANALYTICS_COMPONENT, &interactions_query),
            self.stats.get_component_data(ANALYTICS_COMPONENT, &online_query),
        );

        let active = active.and_then(|d| d.into_count(StatsQueryKind::ActiveUsersCount));
        let interactions =
            interactions.and_then(|d| d.into_count(StatsQueryKind::InteractionsCount));
        let online = online.and_then(|d| d.into_users(StatsQueryKind::OnlineUsers));

        let mut failed = 0;
        let Ok(mut state) = self.state.lock() else {
            return RefreshOutcome::Failed;
        };
        state.roll_day(self.clock.now());

        if state.day != today {
            match online {
                Ok(ids) => state.online.replace_all(ids, now),
                Err(e) => {
                    self.metrics.increment_refresh_failures();
                    warn!(event = %Event::RefreshFailed, query = %StatsQueryKind::OnlineUsers, error = %e, "keeping last-known-good value");
                }
            }
            info!(event = %Event::DayRollover, queried = %today, current = %state.day, "refresh crossed midnight; day counters discarded");
            return RefreshOutcome::Outdated;
        }

        match active {
            Ok(count) => state.active_users_today = count,
            Err(e) => {
                failed += 1;
                self.metrics.increment_refresh_failures();
                warn!(event = %Event::RefreshFailed, query = %StatsQueryKind::ActiveUsersCount, error = %e, "keeping last-known-good value");
            }
        }
        match interactions {
            Ok(count) => state.today_interactions = count,
            Err(e) => {
                failed += 1;
                self.metrics.increment_refresh_failures();
                warn!(event = %Event::RefreshFailed, query = %StatsQueryKind::InteractionsCount, error = %e, "keeping last-known-good value");
            }
        }
        match online {
            Ok(ids) => state.online.replace_all(ids, now),
            Err(e) => {
                failed += 1;
                self.metrics.increment_refresh_failures();
                warn!(event = %Event::RefreshFailed, query = %StatsQueryKind::OnlineUsers, error = %e, "keeping last-known-good value");
            }
        }

        if failed == 3 {
            return RefreshOutcome::Failed;
        }
        state.refreshed_at = Some(now);
        info!(
            event = %Event::RefreshComplete,
            active_users = state.active_users_today,
            interactions = state.today_interactions,
            online = state.online.len(),
            failed,
            "aggregates refreshed"
        );

        if failed == 0 {
            RefreshOutcome::Applied
        } else {
            RefreshOutcome::Partial { failed }
        }
    }

    /// Copy of the current aggregates
    pub fn snapshot(&self) -> AggregateSnapshot {
        let now = self.clock.now();
        match self.state.lock() {
            Ok(mut state) => {
                state.roll_day(now);
                AggregateSnapshot {
                    day: state.day,
                    active_users_today: state.active_users_today,
                    today_interactions: state.today_interactions,
                    interactions: state.interactions,
                    online_users: state.online.online(now),
                    refreshed_at: state.refreshed_at,
                }
            }
            Err(_) => AggregateSnapshot {
                day: now.date_naive(),
                active_users_today: 0,
                today_interactions: 0,
                interactions: InteractionCounters::default(),
                online_users: Vec::new(),
                refreshed_at: None,
            },
        }
    }

    /// Last applied refresh
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ok().and_then(|s| s.refreshed_at)
    }

    /// True when no refresh applied within `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.refreshed_at() {
            Some(at) => self.clock.now() - at > max_age,
            None => true,
        }
    }

    /// True while a refresh is in flight
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::realtime::change::RawChangeNotification;
    use crate::realtime::normalizer::Normalizer;
    use crate::realtime::errors::StatsError;
    use crate::realtime::stats::{ComponentData, MemoryStatsSource};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        clock: ManualClock,
        stats: MemoryStatsSource,
        metrics: Arc<SyncMetrics>,
        store: AggregateStore,
        normalizer: Normalizer,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let stats = MemoryStatsSource::new();
        let metrics = Arc::new(SyncMetrics::new());
        let store = AggregateStore::new(
            Arc::new(stats.clone()),
            Arc::new(clock.clone()),
            Duration::minutes(5),
            Arc::clone(&metrics),
        );
        let normalizer = Normalizer::new(Arc::new(clock.clone()));
        Fixture {
            clock,
            stats,
            metrics,
            store,
            normalizer,
        }
    }

    fn feed(f: &Fixture, n: RawChangeNotification) {
        for event in f.normalizer.normalize(&n).unwrap() {
            f.store.apply(&event);
        }
    }

    #[test]
    fn test_increments() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));
        feed(&f, RawChangeNotification::insert("comments", json!({"user_id": "u2", "character_id": "c1"})));
        feed(&f, RawChangeNotification::insert("user_analytics", json!({"user_id": "u3", "activity_type": "login"})));
        feed(&f, RawChangeNotification::insert("users", json!({"id": "u4"})));
        feed(&f, RawChangeNotification::update("users", json!({"id": "u4"}), json!({"id": "u4"})));

        let snap = f.store.snapshot();
        assert_eq!(snap.today_interactions, 3);
        assert_eq!(snap.interactions.likes, 1);
        assert_eq!(snap.interactions.comments, 1);
        assert_eq!(snap.active_users_today, 1);
        assert_eq!(snap.online_users, vec!["u1", "u2", "u3"]);
        assert_eq!(snap.refreshed_at, None);
    }

    #[test]
    fn test_realtime_echo_counted_once() {
        let f = fixture();
        feed(
            &f,
            RawChangeNotification::insert(
                "realtime_interactions",
                json!({"user_id": "u1", "character_id": "c1", "interaction_type": "play"}),
            ),
        );

        let snap = f.store.snapshot();
        assert_eq!(snap.today_interactions, 1);
        assert_eq!(snap.interactions.plays, 1);
    }

    #[test]
    fn test_unidentified_users_not_online() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"character_id": "c1"})));

        let snap = f.store.snapshot();
        assert_eq!(snap.today_interactions, 1);
        assert!(snap.online_users.is_empty());
    }

    #[test]
    fn test_online_window_expires() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));

        f.clock.advance(Duration::minutes(6));
        assert!(f.store.snapshot().online_users.is_empty());
    }

    #[test]
    fn test_day_rollover_resets_counters() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));

        f.clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap());
        let snap = f.store.snapshot();
        assert_eq!(snap.day, NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(snap.today_interactions, 0);
        assert_eq!(snap.interactions, InteractionCounters::default());
    }

    #[tokio::test]
    async fn test_refresh_overwrites() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));

        f.stats.set_active_users(42);
        f.stats.set_interactions(99);
        f.stats.set_online_users(["a", "b"]);

        assert_eq!(f.store.refresh().await, RefreshOutcome::Applied);
        let snap = f.store.snapshot();
        assert_eq!(snap.active_users_today, 42);
        assert_eq!(snap.today_interactions, 99);
        assert_eq!(snap.online_users, vec!["a", "b"]);
        assert_eq!(snap.refreshed_at, Some(f.clock.now()));
        // per-type counters are live-only
        assert_eq!(snap.interactions.likes, 1);
    }

    #[tokio::test]
    async fn test_refresh_queries() {
        let f = fixture();
        f.store.refresh().await;

        let queries = f.stats.queries();
        assert_eq!(queries.len(), 3);
        let online = queries
            .iter()
            .find(|q| q.kind == StatsQueryKind::OnlineUsers)
            .unwrap();
        assert_eq!(
            online.timestamp_filter,
            Some(f.clock.now() - Duration::minutes(5))
        );
        let active = queries
            .iter()
            .find(|q| q.kind == StatsQueryKind::ActiveUsersCount)
            .unwrap();
        assert_eq!(active.date_filter, Some(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
    }

    #[tokio::test]
    async fn test_partial_refresh_keeps_last_known_good() {
        let f = fixture();
        f.stats.set_active_users(5);
        f.stats.set_interactions(6);
        f.store.refresh().await;

        f.stats.set_active_users(50);
        f.stats.set_interactions(60);
        f.stats.fail(StatsQueryKind::InteractionsCount);

        assert_eq!(f.store.refresh().await, RefreshOutcome::Partial { failed: 1 });
        let snap = f.store.snapshot();
        assert_eq!(snap.active_users_today, 50);
        assert_eq!(snap.today_interactions, 6);
        assert_eq!(f.metrics.snapshot().refresh_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_changes_nothing() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));
        f.stats.fail_all();

        assert_eq!(f.store.refresh().await, RefreshOutcome::Failed);
        let snap = f.store.snapshot();
        assert_eq!(snap.today_interactions, 1);
        assert_eq!(snap.refreshed_at, None);
        assert!(f.store.is_stale(Duration::seconds(30)));
        assert_eq!(f.metrics.snapshot().refreshes, 1);
        assert_eq!(f.metrics.snapshot().refresh_failures, 3);
    }

    #[tokio::test]
    async fn test_staleness() {
        let f = fixture();
        f.store.refresh().await;
        assert!(!f.store.is_stale(Duration::seconds(30)));

        f.clock.advance(Duration::seconds(31));
        assert!(f.store.is_stale(Duration::seconds(30)));
        assert!(!f.store.is_refreshing());
    }

    /// Moves the clock past midnight, then answers slowly
    struct MidnightStats {
        clock: ManualClock,
        next_day: DateTime<Utc>,
    }

    #[async_trait]
    impl StatsSource for MidnightStats {
        async fn get_component_data(
            &self,
            _component_type: &str,
            query: &ComponentQuery,
        ) -> Result<ComponentData, StatsError> {
            self.clock.set(self.next_day);
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(match query.kind {
                StatsQueryKind::OnlineUsers => ComponentData::Users(vec!["u9".into()]),
                _ => ComponentData::Count(500),
            })
        }
    }

    #[tokio::test]
    async fn test_refresh_across_midnight_keeps_live_counts() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap());
        let next_day = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap();
        let store = Arc::new(AggregateStore::new(
            Arc::new(MidnightStats {
                clock: clock.clone(),
                next_day,
            }),
            Arc::new(clock.clone()),
            Duration::minutes(5),
            Arc::new(SyncMetrics::new()),
        ));
        let normalizer = Normalizer::new(Arc::new(clock.clone()));

        let refreshing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.refresh().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(clock.now(), next_day);

        let like = RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"}));
        for event in normalizer.normalize(&like).unwrap() {
            store.apply(&event);
        }

        assert_eq!(refreshing.await.unwrap(), RefreshOutcome::Outdated);
        let snap = store.snapshot();
        assert_eq!(snap.day, NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(snap.interactions.likes, 1);
        assert_eq!(snap.today_interactions, 1);
        assert_eq!(snap.active_users_today, 0);
        assert_eq!(snap.refreshed_at, None);
    }

    #[test]
    fn test_earlier_instant_never_rolls_day_back() {
        let f = fixture();
        f.clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap());
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));

        let mut state = f.store.state.lock().unwrap();
        state.roll_day(Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap());
        assert_eq!(state.day, NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(state.interactions.likes, 1);
    }

    #[test]
    fn test_apply_prunes_stale_presence() {
        let f = fixture();
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u1", "character_id": "c1"})));
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u2", "character_id": "c1"})));

        f.clock.advance(Duration::minutes(6));
        feed(&f, RawChangeNotification::insert("likes", json!({"user_id": "u3", "character_id": "c1"})));

        let state = f.store.state.lock().unwrap();
        assert_eq!(state.online.len(), 1);
        assert!(state.online.is_tracked("u3"));
    }
}
