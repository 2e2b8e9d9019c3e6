//! # Sync Errors
//!
//! Error types for the realtime sync module.

use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync service and channel registry errors
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // ==================
    // Channel Errors
    // ==================
    /// Topic is not part of the routing table
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Subscription did not confirm within the configured timeout
    #[error("Subscription to {0} not confirmed within {1}ms")]
    SubscribeTimeout(String, u64),

    /// Subscription was closed or gave up before becoming active
    #[error("Subscription to {0} failed: {1}")]
    SubscribeFailed(String, String),

    /// Channel not found
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    // ==================
    // Lifecycle Errors
    // ==================
    /// Service was destroyed and cannot be reused
    #[error("Sync service has been destroyed")]
    Destroyed,

    /// Must be called from within a tokio runtime
    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Stable error code for log correlation
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::UnknownTopic(_) => "SYNC_UNKNOWN_TOPIC",
            SyncError::SubscribeTimeout(_, _) => "SYNC_SUBSCRIBE_TIMEOUT",
            SyncError::SubscribeFailed(_, _) => "SYNC_SUBSCRIBE_FAILED",
            SyncError::ChannelNotFound(_) => "SYNC_CHANNEL_NOT_FOUND",
            SyncError::Destroyed => "SYNC_DESTROYED",
            SyncError::NoRuntime(_) => "SYNC_NO_RUNTIME",
            SyncError::Internal(_) => "SYNC_INTERNAL",
            SyncError::Config(_) => "SYNC_CONFIG",
        }
    }

    /// Whether a caller can retry the operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SubscribeTimeout(_, _) | SyncError::SubscribeFailed(_, _)
        )
    }
}

/// Errors reported by the change-data-capture transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not open the channel
    #[error("Failed to open channel: {0}")]
    Open(String),

    /// Connection dropped after the channel was open
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Server sent something that could not be decoded
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Errors from the authoritative stats backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    /// Backend unreachable or returned a failure
    #[error("Stats query failed: {0}")]
    QueryFailed(String),

    /// Backend answered with the wrong shape for the query kind
    #[error("Unexpected response for {0}")]
    UnexpectedShape(String),
}

/// Errors from a usage-log sink
#[derive(Debug, Error)]
pub enum UsageLogError {
    /// I/O failure writing the record
    #[error("Usage log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("Usage log encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Remote sink rejected the write
    #[error("Usage log rejected: {0}")]
    Rejected(String),
}
