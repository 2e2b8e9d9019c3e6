//! # Dispatch Bus
//!
//! In-process fan-out of domain events to callbacks keyed by event kind.
//!
//! Callbacks run synchronously on the publishing task, in registration
//! order. A callback that errors or panics is logged and skipped; the rest
//! still run. There is no queueing or replay: a callback only sees events
//! published after it registered.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use super::event::{DomainEvent, EventKind};
use crate::observability::Event;

/// Error type callbacks may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Registered callback
pub type SyncCallback = Arc<dyn Fn(&DomainEvent) -> Result<(), CallbackError> + Send + Sync>;

/// Handle returned by [`DispatchBus::on`]; pass it to [`DispatchBus::off`]
/// to deregister.
#[must_use = "keep the token to be able to deregister the callback"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken {
    kind: EventKind,
    id: u64,
}

impl CallbackToken {
    /// Event kind the callback listens to
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

struct Registration {
    id: u64,
    callback: SyncCallback,
}

/// Event-kind keyed callback registry
pub struct DispatchBus {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<EventKind, Vec<Registration>>>,
}

impl Default for DispatchBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DispatchBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBus")
            .field("callbacks", &self.len())
            .finish()
    }
}

impl DispatchBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Register `callback` for `kind`
    pub fn on<F>(&self, kind: EventKind, callback: F) -> CallbackToken
    where
        F: Fn(&DomainEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.entry(kind).or_default().push(Registration {
                id,
                callback: Arc::new(callback),
            });
        }
        CallbackToken { kind, id }
    }

    /// Deregister; returns false if the token was already removed
    pub fn off(&self, token: &CallbackToken) -> bool {
        let Ok(mut callbacks) = self.callbacks.write() else {
            return false;
        };
        let Some(list) = callbacks.get_mut(&token.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != token.id);
        before != list.len()
    }

    /// Deliver `event` to every callback registered for its kind
    pub fn publish(&self, event: &DomainEvent) -> DispatchResult {
        let kind = event.kind();

        // Snapshot under the lock so callbacks may register or deregister.
        let targets: Vec<(u64, SyncCallback)> = match self.callbacks.read() {
            Ok(callbacks) => callbacks
                .get(&kind)
                .map(|list| {
                    list.iter()
                        .map(|r| (r.id, Arc::clone(&r.callback)))
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => return DispatchResult::default(),
        };

        let mut result = DispatchResult::default();
        for (id, callback) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => result.delivered += 1,
                Ok(Err(e)) => {
                    result.failed += 1;
                    warn!(event = %Event::CallbackFailed, kind = %kind, callback = id, error = %e, "sync callback returned an error");
                }
                Err(payload) => {
                    result.failed += 1;
                    warn!(event = %Event::CallbackFailed, kind = %kind, callback = id, panic = panic_message(&*payload), "sync callback panicked");
                }
            }
        }
        result
    }

    /// Remove every callback
    pub fn clear(&self) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.clear();
        }
    }

    /// Callbacks registered for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.callbacks
            .read()
            .map(|c| c.get(&kind).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total callbacks
    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .map(|c| c.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Result of publishing one event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    /// Callbacks that completed
    pub delivered: usize,
    /// Callbacks that errored or panicked
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::change::Operation;
    use crate::realtime::event::{ActivityDetails, ActivityType, EventPayload, UserActivity};
    use chrono::Utc;
    use std::sync::Mutex;

    fn activity() -> DomainEvent {
        DomainEvent {
            timestamp: Utc::now(),
            topic: "user_analytics".into(),
            operation: Operation::Insert,
            payload: EventPayload::UserActivity(UserActivity {
                user_id: Some("u1".into()),
                activity_type: ActivityType::Login,
                details: ActivityDetails::Other(Default::default()),
            }),
        }
    }

    #[test]
    fn test_registration_order() {
        let bus = DispatchBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            let _ = bus.on(EventKind::UserActivity, move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        let result = bus.publish(&activity());
        assert_eq!(result.delivered, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_callback_is_isolated() {
        let bus = DispatchBus::new();
        let calls = Arc::new(AtomicU64::new(0));

        let _ = bus.on(EventKind::UserActivity, |_| Err("boom".into()));
        let c = Arc::clone(&calls);
        let _ = bus.on(EventKind::UserActivity, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = bus.publish(&activity());
        assert_eq!(result, DispatchResult { delivered: 1, failed: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let bus = DispatchBus::new();
        let calls = Arc::new(AtomicU64::new(0));

        let _ = bus.on(EventKind::UserActivity, |_| panic!("callback exploded"));
        let c = Arc::clone(&calls);
        let _ = bus.on(EventKind::UserActivity, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = bus.publish(&activity());
        assert_eq!(result.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_deregisters() {
        let bus = DispatchBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);

        let token = bus.on(EventKind::UserActivity, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(token.kind(), EventKind::UserActivity);

        bus.publish(&activity());
        assert!(bus.off(&token));
        assert!(!bus.off(&token));
        bus.publish(&activity());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_only_matching_kind_invoked() {
        let bus = DispatchBus::new();
        let _ = bus.on(EventKind::AccountChange, |_| panic!("wrong kind"));

        let result = bus.publish(&activity());
        assert_eq!(result, DispatchResult::default());
        assert_eq!(bus.subscriber_count(EventKind::AccountChange), 1);
    }

    #[test]
    fn test_callback_may_register_during_publish() {
        let bus = Arc::new(DispatchBus::new());
        let inner = Arc::clone(&bus);
        let _ = bus.on(EventKind::UserActivity, move |_| {
            let _ = inner.on(EventKind::AccountChange, |_| Ok(()));
            Ok(())
        });

        bus.publish(&activity());
        assert_eq!(bus.subscriber_count(EventKind::AccountChange), 1);
    }

    #[test]
    fn test_clear() {
        let bus = DispatchBus::new();
        let _ = bus.on(EventKind::UserActivity, |_| Ok(()));
        let _ = bus.on(EventKind::AccountChange, |_| Ok(()));
        assert_eq!(bus.len(), 2);

        bus.clear();
        assert!(bus.is_empty());
    }
}
