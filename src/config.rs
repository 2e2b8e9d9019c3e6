//! Sync service configuration
//!
//! Loaded from a JSON file; every field has a default, so `{}` is a valid
//! configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::observability::Event;
use crate::realtime::change::WatchedTopic;
use crate::realtime::errors::SyncError;
use crate::realtime::reconnect::ReconnectPolicy;
use crate::realtime::subscription::{ChannelKey, ColumnFilter};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    /// File is not valid JSON for this schema
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// One watched channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Table or view name
    pub topic: String,

    /// Optional row predicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ColumnFilter>,
}

impl TopicConfig {
    /// Channel key for this entry
    pub fn key(&self) -> ChannelKey {
        let key = ChannelKey::new(self.topic.clone());
        match &self.filter {
            Some(filter) => key.with_filter(filter.clone()),
            None => key,
        }
    }
}

impl From<WatchedTopic> for TopicConfig {
    fn from(topic: WatchedTopic) -> Self {
        Self {
            topic: topic.as_str().to_string(),
            filter: None,
        }
    }
}

/// Sync service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// `component_id` on usage records (default: "mobile_app")
    #[serde(default = "default_component_id")]
    pub component_id: String,

    /// Seconds between authoritative refreshes (default: 30)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Trailing window for online users in seconds (default: 300)
    #[serde(default = "default_online_window_secs")]
    pub online_window_secs: u64,

    /// Events kept in the recent activity feed (default: 10)
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,

    /// Bound on waiting for each channel to confirm (default: 10000)
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,

    /// Channels to open on initialize (default: all ten watched topics)
    #[serde(default = "default_topics")]
    pub topics: Vec<TopicConfig>,

    /// Channel reconnection
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_component_id() -> String {
    "mobile_app".to_string()
}
fn default_refresh_interval_secs() -> u64 {
    30
}
fn default_online_window_secs() -> u64 {
    300
}
fn default_feed_capacity() -> usize {
    10
}
fn default_subscribe_timeout_ms() -> u64 {
    10_000
}
fn default_topics() -> Vec<TopicConfig> {
    WatchedTopic::ALL.iter().copied().map(TopicConfig::from).collect()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            component_id: default_component_id(),
            refresh_interval_secs: default_refresh_interval_secs(),
            online_window_secs: default_online_window_secs(),
            feed_capacity: default_feed_capacity(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            topics: default_topics(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        info!(event = %Event::ConfigLoaded, path = %path.display(), topics = config.topics.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.component_id.is_empty() {
            return Err(ConfigError::Invalid("component_id must not be empty".into()));
        }
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid("refresh_interval_secs must be > 0".into()));
        }
        if self.online_window_secs == 0 {
            return Err(ConfigError::Invalid("online_window_secs must be > 0".into()));
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("subscribe_timeout_ms must be > 0".into()));
        }
        if self.topics.is_empty() {
            return Err(ConfigError::Invalid("topics must not be empty".into()));
        }
        for topic in &self.topics {
            topic
                .topic
                .parse::<WatchedTopic>()
                .map_err(|_| ConfigError::Invalid(format!("unknown topic: '{}'", topic.topic)))?;
        }

        let reconnect = &self.reconnect;
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.jitter must be within [0, 1], got {}",
                reconnect.jitter
            )));
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be >= 1, got {}",
                reconnect.multiplier
            )));
        }
        if reconnect.initial_delay_ms == 0 || reconnect.max_delay_ms == 0 {
            return Err(ConfigError::Invalid("reconnect delays must be > 0".into()));
        }
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid("reconnect.max_attempts must be > 0".into()));
        }

        Ok(())
    }

    /// Refresh period
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Online window
    pub fn online_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.online_window_secs as i64)
    }

    /// Subscribe confirmation bound
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Channel keys to open
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.topics.iter().map(TopicConfig::key).collect()
    }
}
