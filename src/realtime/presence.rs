//! # Online Users
//!
//! Per-user last-seen tracking behind the `online_users` aggregate.
//!
//! Presence is eventually consistent: live events mark users online as they
//! act, and the periodic authoritative refresh replaces the whole set.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Last-seen instant for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    /// Most recent activity
    pub last_seen: DateTime<Utc>,
}

impl Presence {
    /// Check if presence is stale at `now` for the trailing `window`
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_seen > window
    }
}

/// Users seen within a trailing window
#[derive(Debug, Clone)]
pub struct OnlineUsers {
    window: Duration,
    seen: HashMap<String, Presence>,
}

impl Default for OnlineUsers {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

impl OnlineUsers {
    /// Create an empty tracker with the given window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Trailing window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record activity for `user_id`; an older instant never moves last-seen back
    pub fn mark(&mut self, user_id: &str, at: DateTime<Utc>) {
        self.seen
            .entry(user_id.to_string())
            .and_modify(|p| {
                if at > p.last_seen {
                    p.last_seen = at;
                }
            })
            .or_insert(Presence { last_seen: at });
    }

    /// Replace the tracked set with an authoritative list seen at `at`
    pub fn replace_all<I, S>(&mut self, user_ids: I, at: DateTime<Utc>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seen = user_ids
            .into_iter()
            .map(|id| (id.into(), Presence { last_seen: at }))
            .collect();
    }

    /// Sorted user ids still inside the window at `now`
    pub fn online(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, p)| !p.is_stale(now, self.window))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop stale users; returns how many were removed
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen.retain(|_, p| !p.is_stale(now, window));
        before - self.seen.len()
    }

    /// Check if a user is tracked, stale or not
    pub fn is_tracked(&self, user_id: &str) -> bool {
        self.seen.contains_key(user_id)
    }

    /// Get count of tracked users
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_mark_and_window() {
        let mut users = OnlineUsers::new(Duration::minutes(5));
        users.mark("u2", t0());
        users.mark("u1", t0() + Duration::minutes(3));

        assert_eq!(users.online(t0() + Duration::minutes(4)), vec!["u1", "u2"]);
        assert_eq!(users.online(t0() + Duration::minutes(6)), vec!["u1"]);
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn test_mark_keeps_latest() {
        let mut users = OnlineUsers::default();
        users.mark("u1", t0() + Duration::minutes(4));
        users.mark("u1", t0());

        assert_eq!(users.online(t0() + Duration::minutes(8)), vec!["u1"]);
    }

    #[test]
    fn test_replace_all() {
        let mut users = OnlineUsers::default();
        users.mark("stale", t0());

        users.replace_all(vec!["a", "b"], t0());
        assert!(!users.is_tracked("stale"));
        assert_eq!(users.online(t0()), vec!["a", "b"]);
    }

    #[test]
    fn test_cleanup() {
        let mut users = OnlineUsers::new(Duration::minutes(1));
        users.mark("u1", t0());
        users.mark("u2", t0() + Duration::minutes(2));

        assert_eq!(users.cleanup(t0() + Duration::minutes(2)), 1);
        assert!(users.is_tracked("u2"));
        assert!(!users.is_empty());
    }

    #[test]
    fn test_stale_detection() {
        let p = Presence { last_seen: t0() };
        assert!(!p.is_stale(t0() + Duration::seconds(60), Duration::seconds(60)));
        assert!(p.is_stale(t0() + Duration::seconds(61), Duration::seconds(60)));
    }
}
