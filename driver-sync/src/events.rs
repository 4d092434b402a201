//! Scheduler lifecycle events broadcast on the event bus

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        interval_secs: u64,
    },
    Stopped,
    SyncStarted {
        at: DateTime<Utc>,
        forced: bool,
    },
    SyncRetry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    SyncSuccess {
        at: DateTime<Utc>,
    },
    SyncFailed {
        consecutive_errors: u32,
        error: String,
    },
    /// Automatic syncing halted until the scheduler is started again
    CircuitOpen {
        consecutive_errors: u32,
    },
    NetworkOnline,
    NetworkOffline,
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "started",
            SyncEvent::Stopped => "stopped",
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncRetry { .. } => "sync_retry",
            SyncEvent::SyncSuccess { .. } => "sync_success",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::CircuitOpen { .. } => "circuit_open",
            SyncEvent::NetworkOnline => "network_online",
            SyncEvent::NetworkOffline => "network_offline",
        }
    }
}
