//! # Stats Source
//!
//! Authoritative aggregate queries against the analytics backend. The
//! aggregate store calls this on every refresh; live events only adjust the
//! numbers in between.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StatsError;

/// Component the sync layer reads aggregates from
pub const ANALYTICS_COMPONENT: &str = "user_analytics";

/// What a stats query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsQueryKind {
    /// Distinct users active on a day
    ActiveUsersCount,
    /// Interactions recorded on a day
    InteractionsCount,
    /// Users seen after an instant
    OnlineUsers,
}

impl StatsQueryKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsQueryKind::ActiveUsersCount => "active_users_count",
            StatsQueryKind::InteractionsCount => "interactions_count",
            StatsQueryKind::OnlineUsers => "online_users",
        }
    }
}

impl fmt::Display for StatsQueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query sent to `get_component_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentQuery {
    /// Restrict to one calendar day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_filter: Option<NaiveDate>,

    /// Restrict to rows after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_filter: Option<DateTime<Utc>>,

    /// Requested aggregate
    #[serde(rename = "type")]
    pub kind: StatsQueryKind,
}

impl ComponentQuery {
    /// Active users on `day`
    pub fn active_users(day: NaiveDate) -> Self {
        Self {
            date_filter: Some(day),
            timestamp_filter: None,
            kind: StatsQueryKind::ActiveUsersCount,
        }
    }

    /// Interactions on `day`
    pub fn interactions(day: NaiveDate) -> Self {
        Self {
            date_filter: Some(day),
            timestamp_filter: None,
            kind: StatsQueryKind::InteractionsCount,
        }
    }

    /// Users seen after `since`
    pub fn online_users(since: DateTime<Utc>) -> Self {
        Self {
            date_filter: None,
            timestamp_filter: Some(since),
            kind: StatsQueryKind::OnlineUsers,
        }
    }
}

/// Backend answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentData {
    Count(u64),
    Users(Vec<String>),
}

impl ComponentData {
    /// Count answer, or `UnexpectedShape`
    pub fn into_count(self, kind: StatsQueryKind) -> Result<u64, StatsError> {
        match self {
            ComponentData::Count(n) => Ok(n),
            ComponentData::Users(_) => Err(StatsError::UnexpectedShape(kind.to_string())),
        }
    }

    /// User list answer, or `UnexpectedShape`
    pub fn into_users(self, kind: StatsQueryKind) -> Result<Vec<String>, StatsError> {
        match self {
            ComponentData::Users(ids) => Ok(ids),
            ComponentData::Count(_) => Err(StatsError::UnexpectedShape(kind.to_string())),
        }
    }
}

/// Authoritative aggregate backend
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Run one aggregate query for `component_type`
    async fn get_component_data(
        &self,
        component_type: &str,
        query: &ComponentQuery,
    ) -> Result<ComponentData, StatsError>;
}

#[derive(Debug, Default)]
struct MemoryStats {
    active_users: u64,
    interactions: u64,
    online: Vec<String>,
    failing: Vec<StatsQueryKind>,
    queries: VecDeque<ComponentQuery>,
}

/// In-memory stats backend with settable answers
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatsSource {
    inner: Arc<Mutex<MemoryStats>>,
}

impl MemoryStatsSource {
    /// Create a backend answering zero for everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active-users answer
    pub fn set_active_users(&self, count: u64) {
        if let Ok(mut s) = self.inner.lock() {
            s.active_users = count;
        }
    }

    /// Set the interactions answer
    pub fn set_interactions(&self, count: u64) {
        if let Ok(mut s) = self.inner.lock() {
            s.interactions = count;
        }
    }

    /// Set the online-users answer
    pub fn set_online_users<I, S>(&self, user_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut s) = self.inner.lock() {
            s.online = user_ids.into_iter().map(Into::into).collect();
        }
    }

    /// Make one query kind fail until cleared
    pub fn fail(&self, kind: StatsQueryKind) {
        if let Ok(mut s) = self.inner.lock() {
            if !s.failing.contains(&kind) {
                s.failing.push(kind);
            }
        }
    }

    /// Make every query kind fail
    pub fn fail_all(&self) {
        self.fail(StatsQueryKind::ActiveUsersCount);
        self.fail(StatsQueryKind::InteractionsCount);
        self.fail(StatsQueryKind::OnlineUsers);
    }

    /// Stop failing
    pub fn recover(&self) {
        if let Ok(mut s) = self.inner.lock() {
            s.failing.clear();
        }
    }

    /// Queries received so far, oldest first
    pub fn queries(&self) -> Vec<ComponentQuery> {
        self.inner
            .lock()
            .map(|s| s.queries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of queries received
    pub fn call_count(&self) -> usize {
        self.inner.lock().map(|s| s.queries.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StatsSource for MemoryStatsSource {
    async fn get_component_data(
        &self,
        component_type: &str,
        query: &ComponentQuery,
    ) -> Result<ComponentData, StatsError> {
        let mut s = self
            .inner
            .lock()
            .map_err(|_| StatsError::QueryFailed("Lock poisoned".into()))?;

        s.queries.push_back(query.clone());

        if component_type != ANALYTICS_COMPONENT {
            return Err(StatsError::QueryFailed(format!(
                "unknown component: {}",
                component_type
            )));
        }
        if s.failing.contains(&query.kind) {
            return Err(StatsError::QueryFailed(format!("{} unavailable", query.kind)));
        }

        Ok(match query.kind {
            StatsQueryKind::ActiveUsersCount => ComponentData::Count(s.active_users),
            StatsQueryKind::InteractionsCount => ComponentData::Count(s.interactions),
            StatsQueryKind::OnlineUsers => ComponentData::Users(s.online.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_answers() {
        let stats = MemoryStatsSource::new();
        stats.set_active_users(7);
        stats.set_online_users(["u1", "u2"]);

        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let active = stats
            .get_component_data(ANALYTICS_COMPONENT, &ComponentQuery::active_users(day))
            .await
            .unwrap();
        assert_eq!(active, ComponentData::Count(7));

        let since = Utc.with_ymd_and_hms(2024, 6, 1, 11, 55, 0).unwrap();
        let online = stats
            .get_component_data(ANALYTICS_COMPONENT, &ComponentQuery::online_users(since))
            .await
            .unwrap();
        assert_eq!(online, ComponentData::Users(vec!["u1".into(), "u2".into()]));
        assert_eq!(stats.call_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_failure_toggle() {
        let stats = MemoryStatsSource::new();
        stats.fail(StatsQueryKind::InteractionsCount);

        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let result = stats
            .get_component_data(ANALYTICS_COMPONENT, &ComponentQuery::interactions(day))
            .await;
        assert!(matches!(result, Err(StatsError::QueryFailed(_))));

        stats.recover();
        let result = stats
            .get_component_data(ANALYTICS_COMPONENT, &ComponentQuery::interactions(day))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_shape_mismatch() {
        let err = ComponentData::Users(vec![])
            .into_count(StatsQueryKind::ActiveUsersCount)
            .unwrap_err();
        assert_eq!(err, StatsError::UnexpectedShape("active_users_count".into()));
        assert_eq!(
            ComponentData::Count(3)
                .into_count(StatsQueryKind::ActiveUsersCount)
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_wire_forms() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let wire = serde_json::to_value(ComponentQuery::active_users(day)).unwrap();
        assert_eq!(wire, json!({"date_filter": "2024-06-01", "type": "active_users_count"}));

        let data: ComponentData = serde_json::from_value(json!(["a"])).unwrap();
        assert_eq!(data, ComponentData::Users(vec!["a".into()]));
        let data: ComponentData = serde_json::from_value(json!(12)).unwrap();
        assert_eq!(data, ComponentData::Count(12));
    }
}
