//! # Domain Events
//!
//! Typed events produced by the normalizer from raw change notifications.
//! Well-known columns are lifted into typed fields; anything else lands in
//! an `extra` bag so no data is lost.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::change::Operation;
use super::errors::SyncError;

/// Remaining dynamic columns that have no typed home
pub type Extra = Map<String, Value>;

/// Dispatch key for domain events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserActivity,
    ContentInteraction,
    AccountChange,
    CreationActivity,
    MembershipActivity,
    /// Echo of a `realtime_interactions` row
    RealtimeInteraction,
}

impl EventKind {
    /// All kinds
    pub const ALL: [EventKind; 6] = [
        EventKind::UserActivity,
        EventKind::ContentInteraction,
        EventKind::AccountChange,
        EventKind::CreationActivity,
        EventKind::MembershipActivity,
        EventKind::RealtimeInteraction,
    ];

    /// Lower snake-case name, used as the usage-log action type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserActivity => "user_activity",
            EventKind::ContentInteraction => "content_interaction",
            EventKind::AccountChange => "account_change",
            EventKind::CreationActivity => "creation_activity",
            EventKind::MembershipActivity => "membership_activity",
            EventKind::RealtimeInteraction => "realtime_interaction",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SyncError::Internal(format!("unknown event kind: {}", s)))
    }
}

/// What a user did, from `user_analytics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Login,
    Logout,
    PageView,
    Interaction,
    ContentCreate,
    ContentConsume,
    Unknown,
}

impl ActivityType {
    /// Parse a wire value; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "login" => ActivityType::Login,
            "logout" => ActivityType::Logout,
            "page_view" => ActivityType::PageView,
            "interaction" => ActivityType::Interaction,
            "content_create" => ActivityType::ContentCreate,
            "content_consume" => ActivityType::ContentConsume,
            _ => ActivityType::Unknown,
        }
    }
}

/// Kind of content an interaction or creation refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    AiCharacter,
    AudioContent,
    CreationItem,
    /// A `target_type` value outside the known mapping
    Unknown(String),
}

impl ContentType {
    /// Wire name
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::AiCharacter => "ai_character",
            ContentType::AudioContent => "audio_content",
            ContentType::CreationItem => "creation_item",
            ContentType::Unknown(value) => value.as_str(),
        }
    }
}

/// Kind of interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    View,
    Like,
    Comment,
    Follow,
    Play,
    Share,
    Unknown,
}

impl InteractionType {
    /// Parse a wire value; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value {
            "view" => InteractionType::View,
            "like" => InteractionType::Like,
            "comment" => InteractionType::Comment,
            "follow" => InteractionType::Follow,
            "play" => InteractionType::Play,
            "share" => InteractionType::Share,
            _ => InteractionType::Unknown,
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::View => "view",
            InteractionType::Like => "like",
            InteractionType::Comment => "comment",
            InteractionType::Follow => "follow",
            InteractionType::Play => "play",
            InteractionType::Share => "share",
            InteractionType::Unknown => "unknown",
        }
    }
}

/// Typed detail for a user activity, chosen by activity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ActivityDetails {
    /// Login / logout
    Session {
        session_id: Option<String>,
        platform: Option<String>,
        #[serde(default)]
        extra: Extra,
    },
    /// Screen or page visit
    PageView {
        page: Option<String>,
        duration_ms: Option<u64>,
        #[serde(default)]
        extra: Extra,
    },
    /// Content created, consumed or interacted with
    Content {
        content_id: Option<String>,
        content_type: Option<String>,
        #[serde(default)]
        extra: Extra,
    },
    /// Activity type without a known schema
    Other(Extra),
}

/// A user did something in the app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserActivity {
    pub user_id: Option<String>,
    pub activity_type: ActivityType,
    pub details: ActivityDetails,
}

/// Typed detail for a content interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum InteractionDetails {
    Like {
        like_id: Option<String>,
        #[serde(default)]
        extra: Extra,
    },
    Comment {
        comment_id: Option<String>,
        text: Option<String>,
        parent_id: Option<String>,
        #[serde(default)]
        extra: Extra,
    },
    Follow {
        follow_id: Option<String>,
        #[serde(default)]
        extra: Extra,
    },
    /// `interaction_data` of a realtime interaction merged over the row's
    /// remaining columns
    Data(Extra),
}

/// A user interacted with a piece of content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInteraction {
    pub user_id: Option<String>,
    pub content_type: ContentType,
    pub content_id: Option<String>,
    pub interaction_type: InteractionType,
    pub details: InteractionDetails,
}

/// Profile columns lifted from `users`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: Option<String>,
    pub username: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub extra: Extra,
}

/// An account row was created, changed or removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountChange {
    pub user_id: Option<String>,
    pub change: Operation,
    pub profile: UserProfile,
}

/// Summary columns of a created item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub title: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub extra: Extra,
}

/// A creator added, edited or removed content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationActivity {
    pub creator_id: Option<String>,
    pub content_type: ContentType,
    pub content_id: Option<String>,
    pub action: Operation,
    pub content: ContentSummary,
}

/// Membership columns lifted from `user_subscriptions`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub status: Option<String>,
    pub started_at: Option<String>,
    pub expires_at: Option<String>,
    #[serde(default)]
    pub extra: Extra,
}

/// A membership row changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipActivity {
    pub user_id: Option<String>,
    pub subscription_type: Option<String>,
    pub action: Operation,
    pub subscription: SubscriptionDetails,
}

/// Variant-specific event body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    UserActivity(UserActivity),
    ContentInteraction(ContentInteraction),
    AccountChange(AccountChange),
    CreationActivity(CreationActivity),
    MembershipActivity(MembershipActivity),
    RealtimeInteraction(ContentInteraction),
}

/// Normalized event with its common envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Source row time, or the wall clock when the row carries none
    pub timestamp: DateTime<Utc>,

    /// Topic the notification arrived on
    pub topic: String,

    /// Row operation that produced the event
    pub operation: Operation,

    /// Body
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Dispatch key, derived from the payload variant
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::UserActivity(_) => EventKind::UserActivity,
            EventPayload::ContentInteraction(_) => EventKind::ContentInteraction,
            EventPayload::AccountChange(_) => EventKind::AccountChange,
            EventPayload::CreationActivity(_) => EventKind::CreationActivity,
            EventPayload::MembershipActivity(_) => EventKind::MembershipActivity,
            EventPayload::RealtimeInteraction(_) => EventKind::RealtimeInteraction,
        }
    }

    /// The acting user, if the row identified one
    pub fn user_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::UserActivity(a) => a.user_id.as_deref(),
            EventPayload::ContentInteraction(i) | EventPayload::RealtimeInteraction(i) => {
                i.user_id.as_deref()
            }
            EventPayload::AccountChange(a) => a.user_id.as_deref(),
            EventPayload::CreationActivity(c) => c.creator_id.as_deref(),
            EventPayload::MembershipActivity(m) => m.user_id.as_deref(),
        }
    }

    /// True when a required identity field could not be extracted
    pub fn is_incomplete(&self) -> bool {
        match &self.payload {
            EventPayload::ContentInteraction(i) | EventPayload::RealtimeInteraction(i) => {
                i.user_id.is_none() || i.content_id.is_none()
            }
            EventPayload::CreationActivity(c) => c.content_id.is_none(),
            _ => self.user_id().is_none(),
        }
    }

    /// Variant body as JSON (the `data` part of the serialized form)
    pub fn payload_json(&self) -> Value {
        serde_json::to_value(&self.payload)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null)
    }
}
