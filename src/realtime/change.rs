//! # Raw Change Notifications
//!
//! Row-level insert/update/delete notifications as delivered by the
//! change-data-capture transport, plus the fixed set of watched topics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::SyncError;

/// A row snapshot: column name to JSON value
pub type Row = Map<String, Value>;

/// Kind of row mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// New row inserted
    #[serde(alias = "INSERT")]
    Insert,
    /// Existing row updated
    #[serde(alias = "UPDATE")]
    Update,
    /// Row deleted
    #[serde(alias = "DELETE")]
    Delete,
}

impl Operation {
    /// Lower-case wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row mutation on a watched table or view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeNotification {
    /// Table or view name
    pub topic: String,

    /// Mutation kind
    pub operation: Operation,

    /// Row before the change (absent on insert)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,

    /// Row after the change (absent on delete)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
}

impl RawChangeNotification {
    /// Build an insert notification
    pub fn insert(topic: impl Into<String>, after: Value) -> Self {
        Self {
            topic: topic.into(),
            operation: Operation::Insert,
            before: None,
            after: as_row(after),
        }
    }

    /// Build an update notification
    pub fn update(topic: impl Into<String>, before: Value, after: Value) -> Self {
        Self {
            topic: topic.into(),
            operation: Operation::Update,
            before: as_row(before),
            after: as_row(after),
        }
    }

    /// Build a delete notification
    pub fn delete(topic: impl Into<String>, before: Value) -> Self {
        Self {
            topic: topic.into(),
            operation: Operation::Delete,
            before: as_row(before),
            after: None,
        }
    }

    /// The snapshot fields are read from: `after`, else `before`
    pub fn row(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// True when neither snapshot is present
    pub fn is_empty(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

fn as_row(value: Value) -> Option<Row> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// The tables and views the sync layer listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedTopic {
    UserAnalytics,
    Likes,
    Comments,
    CharacterFollows,
    RealtimeInteractions,
    Users,
    AiCharacters,
    CreationItems,
    AudioContents,
    UserSubscriptions,
}

impl WatchedTopic {
    /// Every watched topic, in subscription order
    pub const ALL: [WatchedTopic; 10] = [
        WatchedTopic::UserAnalytics,
        WatchedTopic::Likes,
        WatchedTopic::Comments,
        WatchedTopic::CharacterFollows,
        WatchedTopic::RealtimeInteractions,
        WatchedTopic::Users,
        WatchedTopic::AiCharacters,
        WatchedTopic::CreationItems,
        WatchedTopic::AudioContents,
        WatchedTopic::UserSubscriptions,
    ];

    /// Table name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchedTopic::UserAnalytics => "user_analytics",
            WatchedTopic::Likes => "likes",
            WatchedTopic::Comments => "comments",
            WatchedTopic::CharacterFollows => "character_follows",
            WatchedTopic::RealtimeInteractions => "realtime_interactions",
            WatchedTopic::Users => "users",
            WatchedTopic::AiCharacters => "ai_characters",
            WatchedTopic::CreationItems => "creation_items",
            WatchedTopic::AudioContents => "audio_contents",
            WatchedTopic::UserSubscriptions => "user_subscriptions",
        }
    }
}

impl fmt::Display for WatchedTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchedTopic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WatchedTopic::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::UnknownTopic(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_round_trip_names() {
        for topic in WatchedTopic::ALL {
            assert_eq!(topic.as_str().parse::<WatchedTopic>().unwrap(), topic);
        }
        assert!(matches!(
            "posts".parse::<WatchedTopic>(),
            Err(SyncError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_row_prefers_after() {
        let n = RawChangeNotification::update(
            "users",
            json!({"id": "u1", "email": "old@example.com"}),
            json!({"id": "u1", "email": "new@example.com"}),
        );
        assert_eq!(n.row().unwrap()["email"], "new@example.com");

        let n = RawChangeNotification::delete("users", json!({"id": "u1"}));
        assert_eq!(n.row().unwrap()["id"], "u1");
        assert!(!n.is_empty());
    }

    #[test]
    fn test_deserialize_wire_shape() {
        let n: RawChangeNotification = serde_json::from_value(json!({
            "topic": "likes",
            "operation": "INSERT",
            "after": {"user_id": "u1"}
        }))
        .unwrap();

        assert_eq!(n.operation, Operation::Insert);
        assert!(n.before.is_none());
        assert_eq!(n.after.unwrap()["user_id"], "u1");
    }
}
