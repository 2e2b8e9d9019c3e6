//! # Realtime Sync Module
//!
//! Change-data-capture subscriptions and the event pipeline behind them.
//!
//! ## Architecture
//!
//! - **Change Source**: transport trait yielding raw row notifications
//! - **Channel Registry**: one subscription task per channel key, with reconnection
//! - **Normalizer** (deterministic): raw notification to typed domain events
//! - **Dispatch Bus**: event-kind keyed callbacks
//! - **Aggregate Store**: daily counters and online users, refreshed from stats
//! - **Activity Feed**: the last few events for the monitor view
//! - **Usage Logger**: fire-and-forget audit records

pub mod aggregate;
pub mod change;
pub mod channel;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod feed;
pub mod normalizer;
pub mod presence;
pub mod reconnect;
pub mod source;
pub mod stats;
pub mod subscription;
pub mod usage;

pub use aggregate::{AggregateSnapshot, AggregateStore, InteractionCounters, RefreshOutcome};
pub use change::{Operation, RawChangeNotification, Row, WatchedTopic};
pub use channel::{ChannelHandle, ChannelRegistry, NotificationHandler};
pub use dispatcher::{CallbackError, CallbackToken, DispatchBus, DispatchResult};
pub use errors::{StatsError, SyncError, SyncResult, TransportError, UsageLogError};
pub use event::{DomainEvent, EventKind, EventPayload};
pub use feed::ActivityFeed;
pub use normalizer::Normalizer;
pub use presence::OnlineUsers;
pub use reconnect::{CircuitBreaker, ReconnectPolicy};
pub use source::{ChangeSource, ChangeStream, MemoryChangeSource};
pub use stats::{ComponentData, ComponentQuery, MemoryStatsSource, StatsQueryKind, StatsSource};
pub use subscription::{ChannelKey, ChannelStatus, ColumnFilter};
pub use usage::{FileUsageLog, MemoryUsageLog, UsageLogger, UsageRecord, UsageSink};
