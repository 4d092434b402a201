//! The public entry point: reconciliation plus the background scheduler
//! wired to one record store.

use crate::bulk::{BulkCoordinator, BulkReport};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::guard::GuardedReconciler;
use crate::network::NetworkStatus;
use crate::reconciler::{Collections, EntityReconciler, ReconciliationResult};
use crate::schedule_state::{InMemoryScheduleStore, ScheduleStateStore};
use crate::scheduler::{FetchOperation, SchedulerStatus, SyncOutcome, SyncScheduler};
use crate::store::{Record, RecordStore};
use async_trait::async_trait;
use events_bus::{EventBus, Subscription};
use std::sync::Arc;
use std::time::Duration;

/// Default scheduled work: reconcile every active driver.
///
/// Per-key failures stay in the bulk report; only a failure to list the
/// identity records fails the attempt.
pub struct FullPull {
    bulk: Arc<BulkCoordinator>,
}

impl FullPull {
    pub fn new(bulk: Arc<BulkCoordinator>) -> Self {
        Self { bulk }
    }
}

#[async_trait]
impl FetchOperation for FullPull {
    async fn fetch(&self) -> SyncResult<()> {
        let report = self.bulk.reconcile_all().await?;
        tracing::debug!(
            successful = report.successful,
            total = report.total,
            "Full pull finished"
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct SyncServiceBuilder {
    store: Option<Arc<dyn RecordStore>>,
    config: SyncConfig,
    state_store: Option<Arc<dyn ScheduleStateStore>>,
    network: Option<NetworkStatus>,
    clock: Option<Arc<dyn Clock>>,
    fetch: Option<Arc<dyn FetchOperation>>,
    events: Option<EventBus<SyncEvent>>,
}

impl SyncServiceBuilder {
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a non-durable in-memory store
    pub fn state_store(mut self, state_store: Arc<dyn ScheduleStateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    /// Defaults to always online
    pub fn network(mut self, network: NetworkStatus) -> Self {
        self.network = Some(network);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the scheduled work. Defaults to [`FullPull`].
    pub fn fetch(mut self, fetch: Arc<dyn FetchOperation>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn events(mut self, events: EventBus<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> SyncResult<SyncService> {
        let store = self.store.ok_or_else(|| {
            SyncError::InvalidOperation("a record store is required".to_string())
        })?;
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let network = self.network.unwrap_or_default();
        let events = self.events.unwrap_or_default();
        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(InMemoryScheduleStore::new()));

        let reconciler = EntityReconciler::new(store, clock.clone())
            .with_collections(Collections::from(&self.config.store));
        let reconciler = Arc::new(GuardedReconciler::new(reconciler));
        let bulk = Arc::new(
            BulkCoordinator::new(reconciler.clone())
                .with_max_concurrency(self.config.reconcile.max_concurrency),
        );

        let fetch = self
            .fetch
            .unwrap_or_else(|| Arc::new(FullPull::new(bulk.clone())));

        let scheduler = SyncScheduler::new(
            self.config.scheduler.clone(),
            fetch,
            state_store,
            events.clone(),
            network.clone(),
            clock,
        )
        .await?;

        Ok(SyncService {
            config: self.config,
            reconciler,
            bulk,
            scheduler,
            events,
            network,
        })
    }
}

pub struct SyncService {
    config: SyncConfig,
    reconciler: Arc<GuardedReconciler>,
    bulk: Arc<BulkCoordinator>,
    scheduler: SyncScheduler,
    events: EventBus<SyncEvent>,
    network: NetworkStatus,
}

impl SyncService {
    pub fn builder() -> SyncServiceBuilder {
        SyncServiceBuilder::default()
    }

    /// Mirror one driver's identity record into the business collection
    pub async fn reconcile_entity(&self, key: &str) -> ReconciliationResult {
        self.reconciler.reconcile(key).await
    }

    /// Copy the reverse-syncable business fields in `fields` onto the identity record
    pub async fn reconcile_reverse(&self, key: &str, fields: &Record) -> SyncResult<bool> {
        self.reconciler.reconcile_reverse(key, fields).await
    }

    pub async fn reconcile_all(&self) -> SyncResult<BulkReport> {
        self.bulk.reconcile_all().await
    }

    /// Start the scheduler, falling back to the configured interval
    pub async fn start_scheduler(&self, interval_minutes: Option<u64>) -> SyncResult<()> {
        let minutes = interval_minutes.unwrap_or(self.config.scheduler.interval_minutes);
        self.scheduler
            .start(Duration::from_secs(minutes.saturating_mul(60)))
            .await
    }

    pub fn stop_scheduler(&self) {
        self.scheduler.stop();
    }

    pub async fn trigger_sync_now(&self, force: bool) -> SyncOutcome {
        self.scheduler.trigger_now(force).await
    }

    /// Receive scheduler events until the returned subscription is unsubscribed
    pub fn on_event<F>(&self, handler: F) -> Subscription<SyncEvent>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe_fn(handler)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
