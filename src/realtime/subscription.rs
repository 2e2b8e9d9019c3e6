//! # Channel Keys and Filters
//!
//! A channel is identified by its topic plus an optional column filter.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::change::{RawChangeNotification, WatchedTopic};

/// Filter operator for channel predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
}

impl FilterOp {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
        }
    }
}

/// `column=op.value` predicate evaluated against the row snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnFilter {
    /// Column to filter on
    pub column: String,
    /// Operator
    #[serde(default = "default_op")]
    pub op: FilterOp,
    /// Value compared against the column's string form
    pub value: String,
}

fn default_op() -> FilterOp {
    FilterOp::Eq
}

impl ColumnFilter {
    /// Equality filter
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Check if a notification matches this filter
    pub fn matches(&self, notification: &RawChangeNotification) -> bool {
        let Some(row) = notification.row() else {
            return false;
        };

        let field = match row.get(&self.column) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        match self.op {
            FilterOp::Eq => field.as_deref() == Some(self.value.as_str()),
            FilterOp::Neq => field.as_deref() != Some(self.value.as_str()),
        }
    }
}

impl fmt::Display for ColumnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

/// Identity of one channel subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Watched table or view
    pub topic: String,
    /// Optional row predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ColumnFilter>,
}

impl ChannelKey {
    /// Unfiltered channel on `topic`
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            filter: None,
        }
    }

    /// Add a filter
    pub fn with_filter(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Check if a notification belongs on this channel
    pub fn matches(&self, notification: &RawChangeNotification) -> bool {
        if notification.topic != self.topic {
            return false;
        }
        self.filter
            .as_ref()
            .map(|f| f.matches(notification))
            .unwrap_or(true)
    }
}

impl From<WatchedTopic> for ChannelKey {
    fn from(topic: WatchedTopic) -> Self {
        ChannelKey::new(topic.as_str())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}:{}", self.topic, filter),
            None => f.write_str(&self.topic),
        }
    }
}

/// Lifecycle of a channel subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Opening the stream
    Connecting,
    /// Stream open and delivering
    Active,
    /// Waiting out a backoff or circuit cooldown
    Reconnecting,
    /// Retries exhausted, task exited
    Failed,
    /// Closed by unsubscribe or shutdown
    Closed,
}

impl ChannelStatus {
    /// No further transitions will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelStatus::Failed | ChannelStatus::Closed)
    }
}
