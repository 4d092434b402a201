//! Driver record synchronization
//!
//! Provides:
//! - Field-scoped reconciliation of identity records into business records
//! - Per-key in-flight guard and concurrent bulk reconciliation
//! - Background sync scheduler with retry backoff and a circuit breaker
//! - Schedule state persisted in local SQLite
//! - In-memory and REST record stores

pub mod bulk;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod network;
pub mod reconciler;
pub mod records;
pub mod schedule_state;
pub mod scheduler;
pub mod service;
pub mod store;

pub use bulk::{BulkCoordinator, BulkReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use guard::{GuardedReconciler, KeyedGuard};
pub use network::{spawn_reachability_monitor, NetworkStatus};
pub use reconciler::{EntityReconciler, ReconcileOutcome, ReconciliationResult};
pub use records::{BusinessRecord, IdentityRecord, Role};
pub use schedule_state::{
    InMemoryScheduleStore, PersistedScheduleState, ScheduleStateStore, SqliteScheduleStore,
};
pub use scheduler::{
    fetch_fn, FetchOperation, SchedulerState, SchedulerStatus, SkipReason, SyncOutcome,
    SyncScheduler,
};
pub use service::{FullPull, SyncService, SyncServiceBuilder};
pub use store::{Filter, InMemoryRecordStore, Record, RecordStore, RestRecordStore, StoreFault};
