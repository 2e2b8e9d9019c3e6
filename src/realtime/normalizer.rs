//! # Event Normalizer
//!
//! Maps a raw change notification onto typed domain events.
//!
//! Normalization depends only on the notification and the clock. It never
//! fails for a watched topic: rows missing identity columns still produce
//! an event with `None` fields, so downstream counts track arrivals.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use super::change::{Operation, RawChangeNotification, Row, WatchedTopic};
use super::errors::SyncResult;
use super::event::{
    AccountChange, ActivityDetails, ActivityType, ContentInteraction, ContentSummary,
    ContentType, CreationActivity, DomainEvent, EventPayload, Extra, InteractionDetails,
    InteractionType, MembershipActivity, SubscriptionDetails, UserActivity, UserProfile,
};
use crate::clock::{Clock, SystemClock};
use crate::observability::Event;

/// Columns consumed by the envelope and never copied into `extra`
const ENVELOPE_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

/// Stateless normalizer holding only a clock for the timestamp fallback
#[derive(Clone)]
pub struct Normalizer {
    clock: Arc<dyn Clock>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Normalizer").finish_non_exhaustive()
    }
}

impl Normalizer {
    /// Create a normalizer using `clock` for rows without timestamps
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Normalize one notification.
    ///
    /// Returns one event, or two for `realtime_interactions` (the content
    /// interaction plus its realtime echo). Errors only for topics outside
    /// the routing table.
    pub fn normalize(&self, notification: &RawChangeNotification) -> SyncResult<Vec<DomainEvent>> {
        let topic: WatchedTopic = notification.topic.parse()?;
        let empty = Row::new();
        let row = notification.row().unwrap_or(&empty);
        let op = notification.operation;

        let payloads = match topic {
            WatchedTopic::UserAnalytics => vec![EventPayload::UserActivity(user_activity(row))],
            WatchedTopic::Likes => vec![EventPayload::ContentInteraction(interaction(
                row,
                InteractionType::Like,
            ))],
            WatchedTopic::Comments => vec![EventPayload::ContentInteraction(interaction(
                row,
                InteractionType::Comment,
            ))],
            WatchedTopic::CharacterFollows => vec![EventPayload::ContentInteraction(
                interaction(row, InteractionType::Follow),
            )],
            WatchedTopic::RealtimeInteractions => {
                let interaction = realtime_interaction(row);
                vec![
                    EventPayload::ContentInteraction(interaction.clone()),
                    EventPayload::RealtimeInteraction(interaction),
                ]
            }
            WatchedTopic::Users => vec![EventPayload::AccountChange(account_change(row, op))],
            WatchedTopic::AiCharacters => vec![EventPayload::CreationActivity(creation(
                row,
                op,
                ContentType::AiCharacter,
            ))],
            WatchedTopic::CreationItems => vec![EventPayload::CreationActivity(creation(
                row,
                op,
                ContentType::CreationItem,
            ))],
            WatchedTopic::AudioContents => vec![EventPayload::CreationActivity(creation(
                row,
                op,
                ContentType::AudioContent,
            ))],
            WatchedTopic::UserSubscriptions => {
                vec![EventPayload::MembershipActivity(membership(row, op))]
            }
        };

        let timestamp = self.timestamp(notification);

        Ok(payloads
            .into_iter()
            .map(|payload| DomainEvent {
                timestamp,
                topic: notification.topic.clone(),
                operation: op,
                payload,
            })
            .collect())
    }

    /// `after.created_at`, then `after.updated_at`, then now
    pub fn timestamp(&self, notification: &RawChangeNotification) -> DateTime<Utc> {
        notification
            .after
            .as_ref()
            .and_then(|after| {
                after
                    .get("created_at")
                    .and_then(parse_timestamp)
                    .or_else(|| after.get("updated_at").and_then(parse_timestamp))
            })
            .unwrap_or_else(|| self.clock.now())
    }
}

/// Accepts RFC 3339, Postgres text timestamps and epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
                if let Ok(dt) = DateTime::parse_from_str(s, format) {
                    return Some(dt.with_timezone(&Utc));
                }
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            None
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Content-type inference for the generic interaction topics.
///
/// `character_id` wins; then `target_type`; with neither, ai_character.
pub fn infer_content_type(row: &Row) -> ContentType {
    if has_value(row, "character_id") {
        return ContentType::AiCharacter;
    }
    match str_field(row, "target_type").as_deref() {
        Some("audio") => ContentType::AudioContent,
        Some("creation") => ContentType::CreationItem,
        Some("character") => ContentType::AiCharacter,
        Some(other) => {
            warn!(event = %Event::ContentUnclassified, target_type = other, "unrecognized target_type");
            ContentType::Unknown(other.to_string())
        }
        None => ContentType::AiCharacter,
    }
}

fn user_activity(row: &Row) -> UserActivity {
    let activity_type = str_field(row, "activity_type")
        .map(|t| ActivityType::parse(&t))
        .unwrap_or(ActivityType::Unknown);

    // Detail columns live in `activity_data` when present, else on the row.
    let data = match row.get("activity_data") {
        Some(Value::Object(map)) => map.clone(),
        _ => extra(row, &["user_id", "activity_type", "activity_data"]),
    };

    let details = match activity_type {
        ActivityType::Login | ActivityType::Logout => ActivityDetails::Session {
            session_id: str_field(&data, "session_id"),
            platform: str_field(&data, "platform"),
            extra: extra(&data, &["session_id", "platform"]),
        },
        ActivityType::PageView => ActivityDetails::PageView {
            page: str_field(&data, "page"),
            duration_ms: data.get("duration_ms").and_then(Value::as_u64),
            extra: extra(&data, &["page", "duration_ms"]),
        },
        ActivityType::Interaction | ActivityType::ContentCreate | ActivityType::ContentConsume => {
            ActivityDetails::Content {
                content_id: str_field(&data, "content_id"),
                content_type: str_field(&data, "content_type"),
                extra: extra(&data, &["content_id", "content_type"]),
            }
        }
        ActivityType::Unknown => ActivityDetails::Other(data),
    };

    UserActivity {
        user_id: str_field(row, "user_id"),
        activity_type,
        details,
    }
}

/// Columns lifted onto `ContentInteraction` itself
const INTERACTION_COLUMNS: &[&str] = &["user_id", "character_id", "target_id", "content_id"];

fn interaction(row: &Row, interaction_type: InteractionType) -> ContentInteraction {
    let details = match interaction_type {
        InteractionType::Like => InteractionDetails::Like {
            like_id: str_field(row, "id"),
            extra: extra(row, INTERACTION_COLUMNS),
        },
        InteractionType::Comment => InteractionDetails::Comment {
            comment_id: str_field(row, "id"),
            text: str_field(row, "content").or_else(|| str_field(row, "text")),
            parent_id: str_field(row, "parent_id"),
            extra: extra(
                row,
                &[INTERACTION_COLUMNS, &["content", "text", "parent_id"]].concat(),
            ),
        },
        InteractionType::Follow => InteractionDetails::Follow {
            follow_id: str_field(row, "id"),
            extra: extra(row, INTERACTION_COLUMNS),
        },
        _ => InteractionDetails::Data(extra(row, INTERACTION_COLUMNS)),
    };

    ContentInteraction {
        user_id: str_field(row, "user_id"),
        content_type: infer_content_type(row),
        content_id: content_id(row),
        interaction_type,
        details,
    }
}

fn realtime_interaction(row: &Row) -> ContentInteraction {
    let interaction_type = str_field(row, "interaction_type")
        .map(|t| InteractionType::parse(&t))
        .unwrap_or(InteractionType::Unknown);

    // Nested `interaction_data` keys win over same-named row columns.
    let mut data = extra(row, &[INTERACTION_COLUMNS, &["interaction_type"]].concat());
    if let Some(Value::Object(nested)) = row.get("interaction_data") {
        data.remove("interaction_data");
        data.extend(nested.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    ContentInteraction {
        user_id: str_field(row, "user_id"),
        content_type: ContentType::AiCharacter,
        content_id: content_id(row),
        interaction_type,
        details: InteractionDetails::Data(data),
    }
}

fn account_change(row: &Row, change: Operation) -> AccountChange {
    AccountChange {
        user_id: str_field(row, "id").or_else(|| str_field(row, "user_id")),
        change,
        profile: UserProfile {
            email: str_field(row, "email"),
            username: str_field(row, "username").or_else(|| str_field(row, "display_name")),
            status: str_field(row, "status"),
            extra: extra(row, &["user_id", "email", "username", "display_name", "status"]),
        },
    }
}

fn creation(row: &Row, action: Operation, content_type: ContentType) -> CreationActivity {
    CreationActivity {
        creator_id: str_field(row, "creator_id")
            .or_else(|| str_field(row, "user_id"))
            .or_else(|| str_field(row, "created_by")),
        content_type,
        content_id: str_field(row, "id"),
        action,
        content: ContentSummary {
            title: str_field(row, "title").or_else(|| str_field(row, "name")),
            status: str_field(row, "status"),
            extra: extra(
                row,
                &["creator_id", "user_id", "created_by", "title", "name", "status"],
            ),
        },
    }
}

fn membership(row: &Row, action: Operation) -> MembershipActivity {
    MembershipActivity {
        user_id: str_field(row, "user_id"),
        subscription_type: str_field(row, "subscription_type")
            .or_else(|| str_field(row, "plan")),
        action,
        subscription: SubscriptionDetails {
            status: str_field(row, "status"),
            started_at: str_field(row, "started_at"),
            expires_at: str_field(row, "expires_at"),
            extra: extra(
                row,
                &["user_id", "subscription_type", "plan", "status", "started_at", "expires_at"],
            ),
        },
    }
}

fn content_id(row: &Row) -> Option<String> {
    str_field(row, "character_id")
        .or_else(|| str_field(row, "target_id"))
        .or_else(|| str_field(row, "content_id"))
}

/// String-ish column: strings as-is, numbers stringified, everything else absent
fn str_field(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn has_value(row: &Row, key: &str) -> bool {
    !matches!(row.get(key), None | Some(Value::Null))
}

/// Copy of `row` without envelope columns and the given typed columns
fn extra(row: &Row, typed: &[&str]) -> Extra {
    row.iter()
        .filter(|(k, _)| !ENVELOPE_COLUMNS.contains(&k.as_str()) && !typed.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Convenience for callers that do not hold a normalizer
pub fn normalize(notification: &RawChangeNotification) -> SyncResult<Vec<DomainEvent>> {
    Normalizer::default().normalize(notification)
}
