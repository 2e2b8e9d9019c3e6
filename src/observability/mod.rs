//! Observability for the sync layer
//!
//! - Structured logging through `tracing` (JSON lines in production)
//! - Typed event names for every log line
//! - Lock-free counters
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on the live event path
//! 3. Observability failure never fails a sync operation
//!
//! # Usage
//!
//! ```ignore
//! use mobile_sync::observability::{init_tracing, Event, SyncMetrics};
//!
//! init_tracing("info");
//! tracing::info!(event = %Event::ChannelActive, channel = "likes", "channel active");
//!
//! let metrics = SyncMetrics::new();
//! metrics.increment_events_published();
//! ```

mod events;
mod metrics;

pub use events::Event;
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};

use tracing_subscriber::EnvFilter;

/// Install a JSON `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Calling this twice is
/// harmless: the second install is ignored.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing("debug");
        init_tracing("info");
        tracing::info!(event = %Event::ConfigLoaded, "still logging");
    }
}
