//! Observability events for the sync layer
//!
//! Every log line carries one of these as its `event` field so lines stay
//! greppable across releases. Events are explicit and typed.

use std::fmt;

/// Observable events in the sync layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// `initialize` started
    InitializeBegin,
    /// All channels confirmed
    InitializeComplete,
    /// `initialize` failed
    InitializeFailed,
    /// Teardown started
    DestroyBegin,
    /// Teardown complete
    DestroyComplete,

    // Configuration
    /// Configuration loaded
    ConfigLoaded,

    // Channels
    /// Subscription requested
    ChannelSubscribe,
    /// Existing subscription replaced
    ChannelReplaced,
    /// Stream confirmed by the server
    ChannelActive,
    /// Transport error or server hang-up
    ChannelError,
    /// Retry scheduled after backoff
    ChannelReconnectScheduled,
    /// Retry bound hit, cooling down
    ChannelCircuitOpen,
    /// Retries exhausted
    ChannelGaveUp,
    /// Subscription closed
    ChannelClosed,

    // Pipeline
    /// Notification could not be routed
    NotificationDropped,
    /// Notification carried neither a before nor an after snapshot
    NotificationEmpty,
    /// Event normalized with missing identity fields
    EventIncomplete,
    /// Interaction target type outside the known mapping
    ContentUnclassified,
    /// A dispatch callback returned an error or panicked
    CallbackFailed,
    /// Usage record write failed
    UsageLogFailed,

    // Aggregates
    /// Authoritative refresh applied
    RefreshComplete,
    /// One or more refresh queries failed
    RefreshFailed,
    /// Calendar day changed; counters reset
    DayRollover,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            // Lifecycle
            Event::InitializeBegin => "SYNC_INITIALIZE_BEGIN",
            Event::InitializeComplete => "SYNC_INITIALIZE_COMPLETE",
            Event::InitializeFailed => "SYNC_INITIALIZE_FAILED",
            Event::DestroyBegin => "SYNC_DESTROY_BEGIN",
            Event::DestroyComplete => "SYNC_DESTROY_COMPLETE",

            // Configuration
            Event::ConfigLoaded => "CONFIG_LOADED",

            // Channels
            Event::ChannelSubscribe => "CHANNEL_SUBSCRIBE",
            Event::ChannelReplaced => "CHANNEL_REPLACED",
            Event::ChannelActive => "CHANNEL_ACTIVE",
            Event::ChannelError => "CHANNEL_ERROR",
            Event::ChannelReconnectScheduled => "CHANNEL_RECONNECT_SCHEDULED",
            Event::ChannelCircuitOpen => "CHANNEL_CIRCUIT_OPEN",
            Event::ChannelGaveUp => "CHANNEL_GAVE_UP",
            Event::ChannelClosed => "CHANNEL_CLOSED",

            // Pipeline
            Event::NotificationDropped => "NOTIFICATION_DROPPED",
            Event::NotificationEmpty => "NOTIFICATION_EMPTY",
            Event::EventIncomplete => "EVENT_INCOMPLETE",
            Event::ContentUnclassified => "CONTENT_UNCLASSIFIED",
            Event::CallbackFailed => "CALLBACK_FAILED",
            Event::UsageLogFailed => "USAGE_LOG_FAILED",

            // Aggregates
            Event::RefreshComplete => "AGGREGATE_REFRESH_COMPLETE",
            Event::RefreshFailed => "AGGREGATE_REFRESH_FAILED",
            Event::DayRollover => "AGGREGATE_DAY_ROLLOVER",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
