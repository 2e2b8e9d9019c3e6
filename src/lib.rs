//! mobile-sync - Realtime change-data-capture synchronization for the mobile backend
//!
//! Subscribes to the backend's change streams, normalizes rows into typed
//! domain events, fans them out to in-process consumers, and keeps running
//! aggregates for the monitor view.

pub mod clock;
pub mod config;
pub mod observability;
pub mod realtime;
pub mod service;

pub use config::{ConfigError, SyncConfig};
pub use service::{MonitorStatus, RealtimeStats, ServiceState, SyncService, SyncServiceBuilder};
