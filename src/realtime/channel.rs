//! # Channel Registry
//!
//! Owns the live subscriptions to the change source. At most one
//! subscription exists per channel key; subscribing again replaces it.
//!
//! Each subscription runs as its own task, so delivery is ordered within a
//! channel and unordered across channels. Transport failures are retried
//! per the `ReconnectPolicy`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::change::RawChangeNotification;
use super::errors::{SyncError, SyncResult, TransportError};
use super::reconnect::{CircuitBreaker, ReconnectPolicy, RetryDecision};
use super::source::ChangeSource;
use super::subscription::{ChannelKey, ChannelStatus};
use crate::observability::{Event, SyncMetrics};

/// Callback receiving every notification of one channel, in order
pub type NotificationHandler = Arc<dyn Fn(RawChangeNotification) + Send + Sync>;

/// Shared, sticky-on-close status cell
#[derive(Debug, Clone)]
struct StatusCell(Arc<watch::Sender<ChannelStatus>>);

impl StatusCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(ChannelStatus::Connecting);
        Self(Arc::new(tx))
    }

    /// Update unless already closed; returns false once closed
    fn set(&self, status: ChannelStatus) -> bool {
        let mut open = true;
        self.0.send_if_modified(|current| {
            if *current == ChannelStatus::Closed {
                open = false;
                return false;
            }
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        open
    }

    fn close(&self) {
        self.0.send_replace(ChannelStatus::Closed);
    }

    fn is_closed(&self) -> bool {
        *self.0.borrow() == ChannelStatus::Closed
    }

    fn get(&self) -> ChannelStatus {
        *self.0.borrow()
    }
}

/// Registry bookkeeping for one live subscription
#[derive(Debug)]
struct ChannelEntry {
    id: Uuid,
    status: StatusCell,
    task: JoinHandle<()>,
}

impl ChannelEntry {
    fn close(self) {
        self.status.close();
        self.task.abort();
    }
}

/// Caller-side view of a subscription
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    /// Channel key
    pub key: ChannelKey,
    /// Unique per subscribe call, so a replaced handle is distinguishable
    pub id: Uuid,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelHandle {
    /// Current status
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Wait until the server confirms the channel, bounded by `timeout`
    pub async fn wait_active(&self, timeout: Duration) -> SyncResult<()> {
        let mut rx = self.status.clone();
        let key = self.key.to_string();

        let wait = async {
            loop {
                let status = *rx.borrow_and_update();
                match status {
                    ChannelStatus::Active => return Ok(()),
                    ChannelStatus::Failed | ChannelStatus::Closed => {
                        return Err(SyncError::SubscribeFailed(
                            key.clone(),
                            format!("channel is {:?}", status),
                        ))
                    }
                    ChannelStatus::Connecting | ChannelStatus::Reconnecting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SyncError::SubscribeFailed(
                        key.clone(),
                        "channel dropped".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SyncError::SubscribeTimeout(key.clone(), timeout.as_millis() as u64))?
    }
}

/// Registry of channel subscriptions
pub struct ChannelRegistry {
    source: Arc<dyn ChangeSource>,
    policy: ReconnectPolicy,
    metrics: Arc<SyncMetrics>,
    channels: RwLock<HashMap<ChannelKey, ChannelEntry>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("policy", &self.policy)
            .field("channels", &self.len())
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// Create a registry over `source`
    pub fn new(
        source: Arc<dyn ChangeSource>,
        policy: ReconnectPolicy,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            source,
            policy,
            metrics,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe `handler` to `key`, replacing any existing subscription.
    ///
    /// Returns immediately; use [`ChannelHandle::wait_active`] to wait for
    /// the server's confirmation. Must be called within a tokio runtime.
    pub fn subscribe(
        &self,
        key: ChannelKey,
        handler: NotificationHandler,
    ) -> SyncResult<ChannelHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::NoRuntime(e.to_string()))?;

        let mut channels = self
            .channels
            .write()
            .map_err(|_| SyncError::Internal("Lock poisoned".into()))?;

        if let Some(previous) = channels.remove(&key) {
            info!(event = %Event::ChannelReplaced, channel = %key, previous = %previous.id, "replacing subscription");
            previous.close();
        }

        let id = Uuid::new_v4();
        let status = StatusCell::new();
        let receiver = status.0.subscribe();

        info!(event = %Event::ChannelSubscribe, channel = %key, id = %id, "subscribing");

        let task = runtime.spawn(run_channel(
            Arc::clone(&self.source),
            key.clone(),
            handler,
            self.policy.clone(),
            status.clone(),
            Arc::clone(&self.metrics),
        ));

        channels.insert(key.clone(), ChannelEntry { id, status, task });

        Ok(ChannelHandle {
            key,
            id,
            status: receiver,
        })
    }

    /// Close one subscription, or all of them when `key` is `None`.
    ///
    /// Idempotent: closing something already closed is a no-op. Returns
    /// the number of subscriptions closed by this call.
    pub fn unsubscribe(&self, key: Option<&ChannelKey>) -> usize {
        let removed: Vec<(ChannelKey, ChannelEntry)> = match self.channels.write() {
            Ok(mut channels) => match key {
                Some(key) => channels.remove_entry(key).into_iter().collect(),
                None => channels.drain().collect(),
            },
            Err(_) => return 0,
        };

        let count = removed.len();
        for (key, entry) in removed {
            debug!(event = %Event::ChannelClosed, channel = %key, id = %entry.id, "closing subscription");
            entry.close();
        }
        count
    }

    /// Status of the subscription for `key`
    pub fn status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        self.channels
            .read()
            .ok()
            .and_then(|c| c.get(key).map(|e| e.status.get()))
    }

    /// Keys with a live subscription
    pub fn keys(&self) -> Vec<ChannelKey> {
        self.channels
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscriptions whose status is `Active`
    pub fn active_count(&self) -> usize {
        self.channels
            .read()
            .map(|c| {
                c.values()
                    .filter(|e| e.status.get() == ChannelStatus::Active)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Get subscription count
    pub fn len(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.unsubscribe(None);
    }
}

/// Subscription task: open, forward, and reconnect until closed or given up
async fn run_channel(
    source: Arc<dyn ChangeSource>,
    key: ChannelKey,
    handler: NotificationHandler,
    policy: ReconnectPolicy,
    status: StatusCell,
    metrics: Arc<SyncMetrics>,
) {
    let mut breaker = CircuitBreaker::new(policy);

    loop {
        if !status.set(ChannelStatus::Connecting) {
            return;
        }

        let failure = match source.open(&key).await {
            Ok(mut stream) => {
                breaker.record_success();
                if !status.set(ChannelStatus::Active) {
                    return;
                }
                info!(event = %Event::ChannelActive, channel = %key, "channel active");

                loop {
                    match stream.next().await {
                        Some(Ok(notification)) => {
                            if status.is_closed() {
                                return;
                            }
                            handler(notification);
                        }
                        Some(Err(e)) => break e,
                        None => break TransportError::ConnectionLost("stream closed by server".into()),
                    }
                }
            }
            Err(e) => e,
        };

        if status.is_closed() {
            return;
        }
        warn!(event = %Event::ChannelError, channel = %key, error = %failure, "channel transport error");
        metrics.increment_reconnect_attempts();

        match breaker.record_failure() {
            RetryDecision::Retry(delay) => {
                status.set(ChannelStatus::Reconnecting);
                info!(
                    event = %Event::ChannelReconnectScheduled,
                    channel = %key,
                    attempt = breaker.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::CircuitOpen(cooldown) => {
                status.set(ChannelStatus::Reconnecting);
                warn!(
                    event = %Event::ChannelCircuitOpen,
                    channel = %key,
                    failures = breaker.failures(),
                    cooldown_secs = cooldown.as_secs(),
                    "circuit open"
                );
                tokio::time::sleep(cooldown).await;
                breaker.half_open();
            }
            RetryDecision::GiveUp => {
                status.set(ChannelStatus::Failed);
                error!(
                    event = %Event::ChannelGaveUp,
                    channel = %key,
                    failures = breaker.failures(),
                    "giving up on channel"
                );
                return;
            }
        }
    }
}
