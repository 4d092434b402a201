//! Engine configuration
//!
//! Loaded from an optional file (YAML, TOML or JSON, picked by extension)
//! overlaid with `DRIVER_SYNC__<SECTION>__<FIELD>` environment variables.
//! Every field has a default, so an empty source yields a usable config.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `DRIVER_SYNC__SCHEDULER__INTERVAL_MINUTES`
pub const ENV_PREFIX: &str = "DRIVER_SYNC";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub scheduler: SchedulerConfig,
    pub reconcile: ReconcileConfig,
    pub store: StoreConfig,
    pub state: StateConfig,
    pub network: NetworkConfig,
}

impl SyncConfig {
    /// Load configuration from `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: SyncConfig = settings.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            interval_minutes = config.scheduler.interval_minutes,
            max_attempts = config.scheduler.max_attempts,
            max_consecutive_errors = config.scheduler.max_consecutive_errors,
            "Loaded sync configuration"
        );

        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.scheduler.validate()
    }
}

/// Timer, retry and circuit-breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minutes between scheduled sync attempts
    pub interval_minutes: u64,
    /// Non-forced attempts are refused this soon after a successful sync
    pub min_delay_secs: u64,
    /// Fetch attempts per sync before it counts as failed
    pub max_attempts: u32,
    /// Backoff before retry `n` is `retry_base_delay_ms * n`
    pub retry_base_delay_ms: u64,
    /// Consecutive failed syncs that open the circuit breaker
    pub max_consecutive_errors: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            min_delay_secs: 30,
            max_attempts: 3,
            retry_base_delay_ms: 5_000,
            max_consecutive_errors: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.interval_minutes == 0 {
            return Err(SyncError::InvalidOperation(
                "scheduler.interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidOperation(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(SyncError::InvalidOperation(
                "scheduler.max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Upper bound on concurrent reconciliations in a bulk run; unbounded when unset
    pub max_concurrency: Option<usize>,
}

/// Remote record service connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub identity_collection: String,
    pub business_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321/rest/v1".to_string(),
            api_key: None,
            timeout_secs: 30,
            identity_collection: "identity".to_string(),
            business_collection: "business".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where the schedule state survives restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub db_path: String,
    pub state_key: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: "driver_sync_state.db".to_string(),
            state_key: "driver_sync.schedule_state".to_string(),
        }
    }
}

/// Connectivity checks. Without `check_addr` the network is assumed online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub check_addr: Option<String>,
    pub check_interval_secs: u64,
    pub check_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            check_addr: None,
            check_interval_secs: 15,
            check_timeout_ms: 3_000,
        }
    }
}

impl NetworkConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}
