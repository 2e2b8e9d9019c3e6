//! # Change Sources
//!
//! The change-data-capture transport seen from this crate: something that
//! opens a stream of row notifications for a channel key.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::change::RawChangeNotification;
use super::errors::TransportError;
use super::subscription::ChannelKey;

/// Item yielded by a change stream
pub type ChangeItem = Result<RawChangeNotification, TransportError>;

/// Stream of notifications for one channel. `None` means the server closed it.
pub type ChangeStream = BoxStream<'static, ChangeItem>;

/// A managed publish/subscribe service delivering row-level changes
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a stream for `key`. Resolves once the server confirms.
    async fn open(&self, key: &ChannelKey) -> Result<ChangeStream, TransportError>;
}

struct OpenChannel {
    key: ChannelKey,
    sender: mpsc::UnboundedSender<ChangeItem>,
}

#[derive(Default)]
struct MemoryState {
    channels: Vec<OpenChannel>,
    /// Remaining open attempts that should fail
    failing_opens: usize,
    opens: usize,
}

/// In-process change source for tests and embedding.
///
/// `emit` routes a notification to every open stream whose key matches,
/// mirroring how the managed service fans rows out to channels.
#[derive(Clone, Default)]
pub struct MemoryChangeSource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChangeSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a notification; returns the number of streams it reached
    pub fn emit(&self, notification: RawChangeNotification) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        state.channels.retain(|c| !c.sender.is_closed());

        let mut delivered = 0;
        for channel in state.channels.iter().filter(|c| c.key.matches(&notification)) {
            if channel.sender.send(Ok(notification.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push a transport error into every open stream on `topic`
    pub fn fail_topic(&self, topic: &str, error: TransportError) {
        if let Ok(mut state) = self.state.lock() {
            state.channels.retain(|c| !c.sender.is_closed());
            for channel in state.channels.iter().filter(|c| c.key.topic == topic) {
                let _ = channel.sender.send(Err(error.clone()));
            }
        }
    }

    /// Close every open stream on `topic` as if the server hung up
    pub fn drop_topic(&self, topic: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.channels.retain(|c| c.key.topic != topic);
        }
    }

    /// Make the next `count` calls to `open` fail
    pub fn fail_next_opens(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_opens = count;
        }
    }

    /// Number of live streams on `topic`
    pub fn open_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.channels
                    .iter()
                    .filter(|c| c.key.topic == topic && !c.sender.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Total live streams
    pub fn total_open(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.channels.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }

    /// Total `open` calls seen, including failed ones
    pub fn open_attempts(&self) -> usize {
        self.state.lock().map(|s| s.opens).unwrap_or(0)
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn open(&self, key: &ChannelKey) -> Result<ChangeStream, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Open("lock poisoned".into()))?;
        state.opens += 1;

        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Open(format!("{} unavailable", key)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.channels.push(OpenChannel {
            key: key.clone(),
            sender: tx,
        });

        Ok(receiver_stream(rx))
    }
}

/// Adapt an mpsc receiver into a change stream
pub fn receiver_stream(rx: mpsc::UnboundedReceiver<ChangeItem>) -> ChangeStream {
    stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::subscription::ColumnFilter;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_matching_streams() {
        let source = MemoryChangeSource::new();
        let mut likes = source.open(&ChannelKey::new("likes")).await.unwrap();
        let mut mine = source
            .open(&ChannelKey::new("likes").with_filter(ColumnFilter::eq("user_id", "u2")))
            .await
            .unwrap();

        let delivered = source.emit(RawChangeNotification::insert("likes", json!({"user_id": "u1"})));
        assert_eq!(delivered, 1);

        let got = likes.next().await.unwrap().unwrap();
        assert_eq!(got.topic, "likes");

        source.drop_topic("likes");
        assert!(likes.next().await.is_none());
        assert!(mine.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_opens() {
        let source = MemoryChangeSource::new();
        source.fail_next_opens(1);

        assert!(source.open(&ChannelKey::new("users")).await.is_err());
        assert!(source.open(&ChannelKey::new("users")).await.is_ok());
        assert_eq!(source.open_attempts(), 2);
        assert_eq!(source.open_count("users"), 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_pruned() {
        let source = MemoryChangeSource::new();
        let stream = source.open(&ChannelKey::new("users")).await.unwrap();
        drop(stream);

        assert_eq!(source.open_count("users"), 0);
        assert_eq!(source.emit(RawChangeNotification::insert("users", json!({"id": "u1"}))), 0);
    }
}
