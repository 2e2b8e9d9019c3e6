//! # Activity Feed
//!
//! Bounded ring buffer of the most recent domain events, newest first, for
//! the monitor view. Nothing older than the capacity is retained.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::event::{DomainEvent, EventKind};

/// Default number of events kept
pub const DEFAULT_FEED_CAPACITY: usize = 10;

/// Recent events, newest first
#[derive(Debug)]
pub struct ActivityFeed {
    capacity: usize,
    events: RwLock<VecDeque<DomainEvent>>,
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ActivityFeed {
    /// Create a feed holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum events kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Prepend an event, evicting the oldest beyond capacity
    pub fn push(&self, event: DomainEvent) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut events) = self.events.write() {
            events.push_front(event);
            events.truncate(self.capacity);
        }
    }

    /// All retained events, newest first
    pub fn recent(&self) -> Vec<DomainEvent> {
        self.events
            .read()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events of one kind, newest first
    pub fn recent_of(&self, kind: EventKind) -> Vec<DomainEvent> {
        self.events
            .read()
            .map(|e| e.iter().filter(|ev| ev.kind() == kind).cloned().collect())
            .unwrap_or_default()
    }

    /// Timestamp of the newest event
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.events
            .read()
            .ok()
            .and_then(|e| e.front().map(|ev| ev.timestamp))
    }

    /// Drop everything
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::change::RawChangeNotification;
    use crate::realtime::normalizer::normalize;
    use serde_json::json;

    fn like(n: u32) -> DomainEvent {
        let row = json!({
            "user_id": format!("u{}", n),
            "character_id": "c1",
            "created_at": format!("2024-06-01T12:00:{:02}Z", n),
        });
        normalize(&RawChangeNotification::insert("likes", row))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_newest_first() {
        let feed = ActivityFeed::default();
        feed.push(like(1));
        feed.push(like(2));

        let recent = feed.recent();
        assert_eq!(recent[0].user_id(), Some("u2"));
        assert_eq!(recent[1].user_id(), Some("u1"));
        assert_eq!(feed.last_event_at(), Some(recent[0].timestamp));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let feed = ActivityFeed::default();
        for n in 0..15 {
            feed.push(like(n));
        }

        let recent = feed.recent();
        assert_eq!(recent.len(), DEFAULT_FEED_CAPACITY);
        assert_eq!(recent[0].user_id(), Some("u14"));
        assert_eq!(recent[9].user_id(), Some("u5"));
    }

    #[test]
    fn test_filter_by_kind() {
        let feed = ActivityFeed::new(4);
        feed.push(like(1));
        let login = normalize(&RawChangeNotification::insert(
            "user_analytics",
            json!({"user_id": "u9", "activity_type": "login"}),
        ))
        .unwrap()
        .remove(0);
        feed.push(login);

        assert_eq!(feed.recent_of(EventKind::UserActivity).len(), 1);
        assert_eq!(feed.recent_of(EventKind::ContentInteraction).len(), 1);
        assert_eq!(feed.recent_of(EventKind::AccountChange).len(), 0);
    }

    #[test]
    fn test_zero_capacity_and_clear() {
        let feed = ActivityFeed::new(0);
        feed.push(like(1));
        assert!(feed.is_empty());

        let feed = ActivityFeed::new(3);
        feed.push(like(1));
        feed.clear();
        assert!(feed.is_empty());
        assert_eq!(feed.last_event_at(), None);
    }
}
