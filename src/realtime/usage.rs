//! # Usage Logger
//!
//! Fire-and-forget audit trail: one record per published domain event.
//!
//! - Writes run on spawned tasks and never block the event path
//! - Failures are logged and counted, never retried, never propagated
//! - `FileUsageLog` is append-only, one JSON record per line

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::errors::UsageLogError;
use super::event::DomainEvent;
use crate::observability::{Event, SyncMetrics};

/// Value of `action_data.source` on every record
pub const USAGE_SOURCE: &str = "mobile_app";

/// Body of a usage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageActionData {
    /// Event kind, lower snake case
    pub event_type: String,
    /// Variant body
    pub data: Value,
    /// Event timestamp, RFC 3339
    pub timestamp: String,
    pub source: String,
}

/// One usage-log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub component_id: String,
    pub action_type: String,
    pub action_data: UsageActionData,
}

impl UsageRecord {
    /// Build the record for `event`
    pub fn from_event(component_id: &str, event: &DomainEvent) -> Self {
        let kind = event.kind().as_str().to_string();
        Self {
            component_id: component_id.to_string(),
            action_type: kind.clone(),
            action_data: UsageActionData {
                event_type: kind,
                data: event.payload_json(),
                timestamp: event.timestamp.to_rfc3339(),
                source: USAGE_SOURCE.to_string(),
            },
        }
    }

    /// Serialize to a JSON line
    pub fn to_json(&self) -> Result<String, UsageLogError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Destination for usage records
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Persist one record
    async fn log(&self, record: &UsageRecord) -> Result<(), UsageLogError>;
}

/// File-based usage log
///
/// Append-only, one JSON record per line, flushed after each write.
pub struct FileUsageLog {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl std::fmt::Debug for FileUsageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUsageLog")
            .field("path", &self.path)
            .finish()
    }
}

impl FileUsageLog {
    /// Open or create a usage log file
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Get the usage log path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UsageSink for FileUsageLog {
    async fn log(&self, record: &UsageRecord) -> Result<(), UsageLogError> {
        let line = record.to_json()?;
        let writer = Arc::clone(&self.writer);

        tokio::task::spawn_blocking(move || -> Result<(), UsageLogError> {
            let mut writer = writer
                .lock()
                .map_err(|_| UsageLogError::Rejected("Lock poisoned".into()))?;
            writeln!(writer, "{}", line)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| UsageLogError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

/// In-memory usage log for testing
///
/// Clones share records.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsageLog {
    records: Arc<Mutex<Vec<UsageRecord>>>,
    rejecting: Arc<Mutex<bool>>,
}

impl MemoryUsageLog {
    /// Create a new in-memory usage log
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write while `on` is true
    pub fn reject_writes(&self, on: bool) {
        if let Ok(mut rejecting) = self.rejecting.lock() {
            *rejecting = on;
        }
    }

    /// Get all recorded entries
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Get the number of records
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageSink for MemoryUsageLog {
    async fn log(&self, record: &UsageRecord) -> Result<(), UsageLogError> {
        if self.rejecting.lock().map(|r| *r).unwrap_or(false) {
            return Err(UsageLogError::Rejected("sink offline".into()));
        }
        self.records
            .lock()
            .map_err(|_| UsageLogError::Rejected("Lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}

/// Spawns one write per event and tracks writes in flight
pub struct UsageLogger {
    sink: Arc<dyn UsageSink>,
    component_id: String,
    metrics: Arc<SyncMetrics>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl std::fmt::Debug for UsageLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLogger")
            .field("component_id", &self.component_id)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl UsageLogger {
    /// Create a logger writing to `sink`
    pub fn new(
        sink: Arc<dyn UsageSink>,
        component_id: impl Into<String>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            sink,
            component_id: component_id.into(),
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queue a record for `event`; returns immediately
    pub fn record(&self, event: &DomainEvent) {
        let record = UsageRecord::from_event(&self.component_id, event);

        let Ok(runtime) = Handle::try_current() else {
            self.metrics.increment_usage_log_failures();
            warn!(event = %Event::UsageLogFailed, action_type = %record.action_type, "no runtime; usage record dropped");
            return;
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let sink = Arc::clone(&self.sink);
        let metrics = Arc::clone(&self.metrics);
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);

        runtime.spawn(async move {
            match sink.log(&record).await {
                Ok(()) => {
                    metrics.increment_usage_log_writes();
                    debug!(action_type = %record.action_type, "usage record written");
                }
                Err(e) => {
                    metrics.increment_usage_log_failures();
                    warn!(event = %Event::UsageLogFailed, action_type = %record.action_type, error = %e, "usage record lost");
                }
            }
            if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Wait until every queued write has finished
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Writes not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::change::RawChangeNotification;
    use crate::realtime::normalizer::normalize;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn like() -> DomainEvent {
        normalize(&RawChangeNotification::insert(
            "likes",
            json!({"id": "l1", "user_id": "u1", "character_id": "c1", "created_at": "2024-06-01T12:00:00Z"}),
        ))
        .unwrap()
        .remove(0)
    }

    #[test]
    fn test_record_shape() {
        let record = UsageRecord::from_event("mobile_app", &like());

        assert_eq!(record.component_id, "mobile_app");
        assert_eq!(record.action_type, "content_interaction");
        assert_eq!(record.action_data.event_type, "content_interaction");
        assert_eq!(record.action_data.source, "mobile_app");
        assert_eq!(record.action_data.timestamp, "2024-06-01T12:00:00+00:00");
        assert_eq!(record.action_data.data["user_id"], "u1");
        assert_eq!(record.action_data.data["interaction_type"], "like");
    }

    #[tokio::test]
    async fn test_logger_writes_and_counts() {
        let sink = MemoryUsageLog::new();
        let metrics = Arc::new(SyncMetrics::new());
        let logger = UsageLogger::new(Arc::new(sink.clone()), "mobile_app", Arc::clone(&metrics));

        logger.record(&like());
        logger.record(&like());
        logger.flush().await;

        assert_eq!(sink.len(), 2);
        assert_eq!(logger.in_flight(), 0);
        assert_eq!(metrics.snapshot().usage_log_writes, 2);
    }

    #[tokio::test]
    async fn test_logger_failures_are_swallowed() {
        let sink = MemoryUsageLog::new();
        sink.reject_writes(true);
        let metrics = Arc::new(SyncMetrics::new());
        let logger = UsageLogger::new(Arc::new(sink.clone()), "mobile_app", Arc::clone(&metrics));

        logger.record(&like());
        logger.flush().await;

        assert!(sink.is_empty());
        assert_eq!(metrics.snapshot().usage_log_failures, 1);
    }

    #[test]
    fn test_logger_without_runtime_counts_failure() {
        let metrics = Arc::new(SyncMetrics::new());
        let logger = UsageLogger::new(Arc::new(MemoryUsageLog::new()), "mobile_app", Arc::clone(&metrics));

        logger.record(&like());
        assert_eq!(metrics.snapshot().usage_log_failures, 1);
        assert_eq!(logger.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_file_usage_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let log = FileUsageLog::open(&path).unwrap();
            let record = UsageRecord::from_event("mobile_app", &like());
            log.log(&record).await.unwrap();
            log.log(&record).await.unwrap();
        }

        // Reopen appends
        let log = FileUsageLog::open(&path).unwrap();
        log.log(&UsageRecord::from_event("mobile_app", &like()))
            .await
            .unwrap();
        assert_eq!(log.path(), path.as_path());

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        let parsed: UsageRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.action_type, "content_interaction");
    }
}
