//! Background sync scheduler
//!
//! Runs a caller-supplied fetch operation on a repeating timer. Each attempt
//! passes four guards, cheapest first:
//!
//! 1. another attempt in flight (bypassed by `force`)
//! 2. last success younger than the minimum delay (bypassed by `force`)
//! 3. network offline (not counted as a failure)
//! 4. consecutive-error limit reached (opens the circuit breaker)
//!
//! and then calls the fetch operation up to `max_attempts` times with a
//! linearly growing backoff. Reaching the consecutive-error limit halts the
//! timer until [`SyncScheduler::start`] is called again.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::network::NetworkStatus;
use crate::schedule_state::{PersistedScheduleState, ScheduleStateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use events_bus::EventBus;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// The work a sync attempt performs
#[async_trait]
pub trait FetchOperation: Send + Sync {
    async fn fetch(&self) -> SyncResult<()>;
}

/// [`FetchOperation`] backed by an async closure
pub struct FnFetch<F>(F);

pub fn fetch_fn<F, Fut>(f: F) -> FnFetch<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    FnFetch(f)
}

#[async_trait]
impl<F, Fut> FetchOperation for FnFetch<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    async fn fetch(&self) -> SyncResult<()> {
        (self.0)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
    /// Halted by the circuit breaker; only an explicit start resumes
    CircuitOpen,
}

/// Why an attempt did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyInProgress,
    MinDelay,
    NoNetwork,
    MaxErrorsReached,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyInProgress => "already_in_progress",
            SkipReason::MinDelay => "min_delay",
            SkipReason::NoNetwork => "no_network",
            SkipReason::MaxErrorsReached => "max_errors_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Success {
        timestamp: DateTime<Utc>,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: String,
        consecutive_errors: u32,
    },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }

    pub fn reason(&self) -> Option<SkipReason> {
        match self {
            SyncOutcome::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncOutcome::Success { timestamp } => Some(*timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub in_progress: bool,
    pub interval_secs: Option<u64>,
}

/// Marks an attempt as in flight until dropped, also on early return or panic
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn exclusive(counter: &'a AtomicUsize) -> Option<Self> {
        counter
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(counter))
    }

    fn shared(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Control {
    state: SchedulerState,
    /// Dropping the sender ends the timer task
    shutdown: Option<oneshot::Sender<()>>,
    interval: Option<Duration>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    fetch: Arc<dyn FetchOperation>,
    state_store: Arc<dyn ScheduleStateStore>,
    events: EventBus<SyncEvent>,
    network: NetworkStatus,
    clock: Arc<dyn Clock>,
    control: Mutex<Control>,
    persisted: Mutex<PersistedScheduleState>,
    in_flight: AtomicUsize,
}

/// Cloneable handle to one scheduler instance
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    /// Create a stopped scheduler, resuming the persisted error count
    pub async fn new(
        config: SchedulerConfig,
        fetch: Arc<dyn FetchOperation>,
        state_store: Arc<dyn ScheduleStateStore>,
        events: EventBus<SyncEvent>,
        network: NetworkStatus,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let persisted = state_store.load().await?.unwrap_or_default();

        tracing::debug!(
            consecutive_errors = persisted.consecutive_error_count,
            last_sync_time = ?persisted.last_sync_time,
            "Restored schedule state"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                fetch,
                state_store,
                events,
                network,
                clock,
                control: Mutex::new(Control {
                    state: SchedulerState::Stopped,
                    shutdown: None,
                    interval: None,
                }),
                persisted: Mutex::new(persisted),
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    /// Start the timer: one attempt right away, then one every `interval`.
    ///
    /// No-op when already running. Starting from `CircuitOpen`, or with the
    /// error count already at the limit, clears the breaker.
    pub async fn start(&self, interval: Duration) -> SyncResult<()> {
        if interval.is_zero() {
            return Err(SyncError::InvalidOperation(
                "sync interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let previous = {
            let mut control = self.inner.control.lock();
            if control.state == SchedulerState::Running {
                tracing::debug!("Sync scheduler already running");
                return Ok(());
            }
            let previous = control.state;
            control.state = SchedulerState::Running;
            control.shutdown = Some(shutdown_tx);
            control.interval = Some(interval);
            previous
        };

        let snapshot = {
            let mut persisted = self.inner.persisted.lock();
            if previous == SchedulerState::CircuitOpen
                || persisted.consecutive_error_count >= self.inner.config.max_consecutive_errors
            {
                tracing::info!(
                    consecutive_errors = persisted.consecutive_error_count,
                    "Clearing circuit breaker on restart"
                );
                persisted.consecutive_error_count = 0;
            }
            *persisted
        };
        self.persist(&snapshot).await;

        let interval_secs = interval.as_secs();
        tracing::info!(interval_secs, "Sync scheduler started");
        self.inner.events.publish(&SyncEvent::Started { interval_secs });

        tokio::spawn(self.clone().run_loop(interval, shutdown_rx));
        Ok(())
    }

    /// Cancel the timer. An attempt already in flight runs to completion.
    pub fn stop(&self) {
        {
            let mut control = self.inner.control.lock();
            if control.state != SchedulerState::Running {
                return;
            }
            control.state = SchedulerState::Stopped;
            control.interval = None;
            drop(control.shutdown.take());
        }

        tracing::info!("Sync scheduler stopped");
        self.inner.events.publish(&SyncEvent::Stopped);
    }

    /// Run one sync attempt now, subject to the guards
    #[tracing::instrument(skip(self))]
    pub async fn trigger_now(&self, force: bool) -> SyncOutcome {
        let inner = &self.inner;

        let _flight = if force {
            InFlight::shared(&inner.in_flight)
        } else {
            match InFlight::exclusive(&inner.in_flight) {
                Some(flight) => flight,
                None => {
                    tracing::debug!("Sync already in progress");
                    return Self::skipped(SkipReason::AlreadyInProgress);
                }
            }
        };

        let snapshot = *inner.persisted.lock();

        if !force && self.within_min_delay(&snapshot) {
            tracing::debug!("Last sync too recent");
            return Self::skipped(SkipReason::MinDelay);
        }

        if !inner.network.is_online() {
            tracing::warn!("Network unavailable, sync skipped");
            inner.events.publish(&SyncEvent::NetworkOffline);
            return Self::skipped(SkipReason::NoNetwork);
        }

        if snapshot.consecutive_error_count >= inner.config.max_consecutive_errors {
            self.open_circuit(snapshot.consecutive_error_count);
            return Self::skipped(SkipReason::MaxErrorsReached);
        }

        self.run_attempts(force).await
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.control.lock().state
    }

    pub fn status(&self) -> SchedulerStatus {
        let (state, interval) = {
            let control = self.inner.control.lock();
            (control.state, control.interval)
        };
        let persisted = *self.inner.persisted.lock();

        SchedulerStatus {
            state,
            last_sync_time: persisted.last_sync_at(),
            consecutive_errors: persisted.consecutive_error_count,
            in_progress: self.inner.in_flight.load(Ordering::Acquire) > 0,
            interval_secs: interval.map(|interval| interval.as_secs()),
        }
    }

    pub fn events(&self) -> &EventBus<SyncEvent> {
        &self.inner.events
    }

    fn skipped(reason: SkipReason) -> SyncOutcome {
        SyncOutcome::Skipped { reason }
    }

    fn within_min_delay(&self, state: &PersistedScheduleState) -> bool {
        let Some(last) = state.last_sync_at() else {
            return false;
        };
        match (self.inner.clock.now() - last).to_std() {
            Ok(elapsed) => elapsed < self.inner.config.min_delay(),
            // last success lies in the future
            Err(_) => true,
        }
    }

    async fn run_attempts(&self, forced: bool) -> SyncOutcome {
        let inner = &self.inner;
        let max_attempts = inner.config.max_attempts.max(1);
        let base_delay = inner.config.retry_base_delay();

        tracing::info!(forced, "Sync started");
        inner.events.publish(&SyncEvent::SyncStarted {
            at: inner.clock.now(),
            forced,
        });

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match inner.fetch.fetch().await {
                Ok(()) => return self.record_success().await,
                Err(e) => {
                    let delay = base_delay.saturating_mul(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

                    tracing::warn!(attempt, max_attempts, delay_ms, error = %e, "Sync attempt failed");
                    inner.events.publish(&SyncEvent::SyncRetry {
                        attempt,
                        delay_ms,
                        error: e.to_string(),
                    });

                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        self.record_failure(last_error).await
    }

    async fn record_success(&self) -> SyncOutcome {
        let now = self.inner.clock.now();
        let snapshot = {
            let mut persisted = self.inner.persisted.lock();
            persisted.record_success(now);
            *persisted
        };
        self.persist(&snapshot).await;

        tracing::info!("Sync completed");
        self.inner.events.publish(&SyncEvent::SyncSuccess { at: now });
        SyncOutcome::Success { timestamp: now }
    }

    async fn record_failure(&self, error: Option<SyncError>) -> SyncOutcome {
        let error = error.map_or_else(|| "sync failed".to_string(), |e| e.to_string());
        let (snapshot, consecutive_errors) = {
            let mut persisted = self.inner.persisted.lock();
            let count = persisted.record_failure();
            (*persisted, count)
        };
        self.persist(&snapshot).await;

        tracing::error!(consecutive_errors, error = %error, "Sync failed after all attempts");
        self.inner.events.publish(&SyncEvent::SyncFailed {
            consecutive_errors,
            error: error.clone(),
        });

        if consecutive_errors >= self.inner.config.max_consecutive_errors {
            self.open_circuit(consecutive_errors);
        }

        SyncOutcome::Failed {
            error,
            consecutive_errors,
        }
    }

    fn open_circuit(&self, consecutive_errors: u32) {
        let previous = {
            let mut control = self.inner.control.lock();
            let previous = control.state;
            control.state = SchedulerState::CircuitOpen;
            control.interval = None;
            drop(control.shutdown.take());
            previous
        };

        if previous == SchedulerState::CircuitOpen {
            return;
        }

        tracing::error!(
            consecutive_errors,
            "Consecutive error limit reached, automatic sync halted"
        );
        self.inner
            .events
            .publish(&SyncEvent::CircuitOpen { consecutive_errors });
        if previous == SchedulerState::Running {
            self.inner.events.publish(&SyncEvent::Stopped);
        }
    }

    async fn persist(&self, state: &PersistedScheduleState) {
        if let Err(e) = self.inner.state_store.save(state).await {
            tracing::warn!(error = %e, "Failed to persist schedule state");
        }
    }

    async fn on_network_change(&self, online: bool) {
        if online {
            tracing::info!("Network back online");
            self.inner.events.publish(&SyncEvent::NetworkOnline);
            let outcome = self.trigger_now(false).await;
            tracing::debug!(outcome = ?outcome, "Reconnect sync finished");
        } else {
            tracing::warn!("Network went offline");
            self.inner.events.publish(&SyncEvent::NetworkOffline);
        }
    }

    async fn run_loop(self, interval: Duration, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut network = self.inner.network.subscribe();
        let mut online = *network.borrow_and_update();
        let mut watch_network = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let outcome = self.trigger_now(false).await;
                    tracing::debug!(outcome = ?outcome, "Scheduled sync finished");
                }
                changed = network.changed(), if watch_network => {
                    if changed.is_err() {
                        watch_network = false;
                        continue;
                    }
                    let now_online = *network.borrow_and_update();
                    if now_online != online {
                        online = now_online;
                        self.on_network_change(now_online).await;
                    }
                }
            }
        }

        tracing::debug!("Sync timer task exited");
    }
}
