use driver_sync::config::SyncConfig;
use driver_sync::store::{InMemoryRecordStore, Record, RecordStore, StoreFault};
use driver_sync::{
    fetch_fn, FetchOperation, ManualClock, NetworkStatus, ReconcileOutcome, SchedulerState,
    SkipReason, SqliteScheduleStore, SyncError, SyncEvent, SyncService,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

async fn seed_identity(store: &InMemoryRecordStore, key: &str, name: &str) {
    store
        .insert(
            "identity",
            record(json!({
                "key": key,
                "displayName": name,
                "role": "driver",
                "active": true,
                "lastLoginAt": null,
            })),
        )
        .await
        .unwrap();
}

async fn service_over(store: Arc<InMemoryRecordStore>) -> SyncService {
    SyncService::builder()
        .store(store)
        .clock(Arc::new(ManualClock::default()))
        .build()
        .await
        .unwrap()
}

/// Fetch operation that always fails and counts its calls
fn failing_fetch(calls: Arc<AtomicUsize>) -> Arc<dyn FetchOperation> {
    Arc::new(fetch_fn(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Network("upstream unreachable".to_string()))
        }
    }))
}

fn counting_fetch(calls: Arc<AtomicUsize>) -> Arc<dyn FetchOperation> {
    Arc::new(fetch_fn(move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }))
}

fn event_channel(service: &SyncService) -> mpsc::UnboundedReceiver<SyncEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = service.on_event(move |event: &SyncEvent| {
        let _ = tx.send(event.clone());
    });
    rx
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T1", "Anna").await;
    let service = service_over(store.clone()).await;

    let first = service.reconcile_entity("T1").await;
    let after_first = store.snapshot("business");
    let second = service.reconcile_entity("T1").await;
    let after_second = store.snapshot("business");

    assert_eq!(first.outcome, ReconcileOutcome::Created);
    assert_eq!(second.outcome, ReconcileOutcome::Updated);
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_business_owned_fields_survive_reconcile() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T1", "Anna Neu").await;
    store
        .insert(
            "business",
            record(json!({
                "key": "T1",
                "displayName": "Anna Alt",
                "active": true,
                "role": "driver",
                "dailyTarget": 42,
            })),
        )
        .await
        .unwrap();
    let service = service_over(store.clone()).await;

    let result = service.reconcile_entity("T1").await;
    assert_eq!(result.outcome, ReconcileOutcome::Updated);

    let business = store.snapshot("business");
    assert_eq!(business.len(), 1);
    assert_eq!(business[0]["displayName"], "Anna Neu");
    assert_eq!(business[0]["dailyTarget"], 42);
    assert!(!business[0]["lastSyncedAt"].is_null());
}

#[tokio::test]
async fn test_created_record_gets_defaults() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T7", "Ben").await;
    let service = service_over(store.clone()).await;

    assert_eq!(
        service.reconcile_entity("T7").await.outcome,
        ReconcileOutcome::Created
    );

    let business = store.snapshot("business");
    assert_eq!(business.len(), 1);
    assert_eq!(business[0]["key"], "T7");
    assert_eq!(business[0]["dailyTarget"], 0);
    assert_eq!(business[0]["softDeleted"], false);
    assert_eq!(business[0]["role"], "driver");
}

#[tokio::test]
async fn test_concurrent_reconcile_of_one_key_creates_once() {
    let store = Arc::new(InMemoryRecordStore::new().with_latency(Duration::from_millis(50)));
    seed_identity(&store, "T1", "Anna").await;
    let service = service_over(store.clone()).await;

    let (a, b) = tokio::join!(service.reconcile_entity("T1"), service.reconcile_entity("T1"));

    let mut outcomes = vec![a.outcome, b.outcome];
    outcomes.sort_by_key(|outcome| *outcome as u8);
    assert_eq!(outcomes, vec![ReconcileOutcome::Created, ReconcileOutcome::Noop]);
    assert_eq!(store.snapshot("business").len(), 1);
}

#[tokio::test]
async fn test_bulk_reconcile_reports_partial_failure() {
    let store = Arc::new(InMemoryRecordStore::new());
    for key in ["T1", "T2", "T3", "T4", "T5"] {
        seed_identity(&store, key, key).await;
    }
    store.fail_key("identity", "T3", StoreFault::Network);
    let service = service_over(store.clone()).await;

    let report = service.reconcile_all().await.unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.successful, 4);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "T3");
    assert_eq!(failures[0].outcome, ReconcileOutcome::Failed);
    assert_eq!(store.snapshot("business").len(), 4);
}

#[tokio::test]
async fn test_malformed_identity_row_fails_only_its_own_key() {
    let store = Arc::new(InMemoryRecordStore::new());
    for key in ["T1", "T2", "T3", "T4"] {
        seed_identity(&store, key, key).await;
    }
    store
        .insert(
            "identity",
            record(json!({ "key": "T5", "displayName": null, "role": "driver", "active": true })),
        )
        .await
        .unwrap();
    let service = service_over(store.clone()).await;

    let report = service.reconcile_all().await.unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.successful, 4);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "T5");
    assert!(matches!(failures[0].error, Some(SyncError::Serialization(_))));
    assert_eq!(store.snapshot("business").len(), 4);
}

#[tokio::test]
async fn test_integer_active_flag_is_included_in_bulk_run() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert(
            "identity",
            record(json!({ "key": "T1", "displayName": "Anna", "role": "driver", "active": 1 })),
        )
        .await
        .unwrap();
    store
        .insert(
            "identity",
            record(json!({ "key": "T2", "displayName": "Ben", "role": "driver", "active": 0 })),
        )
        .await
        .unwrap();
    let service = service_over(store.clone()).await;

    let report = service.reconcile_all().await.unwrap();

    assert_eq!(report.total, 1);
    assert_eq!(report.successful, 1);
    assert_eq!(report.details[0].key, "T1");
    assert_eq!(report.details[0].outcome, ReconcileOutcome::Created);
}

#[tokio::test]
async fn test_soft_deleted_business_row_is_never_rewritten() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T1", "New").await;
    let archived = store
        .insert(
            "business",
            record(json!({
                "key": "T1",
                "displayName": "Archived",
                "role": "admin",
                "active": false,
                "dailyTarget": 3,
                "softDeleted": true,
            })),
        )
        .await
        .unwrap();
    let service = service_over(store.clone()).await;

    assert_eq!(
        service.reconcile_entity("T1").await.outcome,
        ReconcileOutcome::Created
    );
    assert_eq!(
        service.reconcile_entity("T1").await.outcome,
        ReconcileOutcome::Updated
    );

    let business = store.snapshot("business");
    assert_eq!(business.len(), 2);
    assert_eq!(business[0], archived);
    assert_eq!(business[1]["displayName"], "New");
    assert_eq!(business[1]["softDeleted"], false);
}

#[tokio::test]
async fn test_bulk_reconcile_respects_concurrency_limit() {
    let store = Arc::new(InMemoryRecordStore::new());
    for key in ["T1", "T2", "T3"] {
        seed_identity(&store, key, key).await;
    }
    let mut config = SyncConfig::default();
    config.reconcile.max_concurrency = Some(1);
    let service = SyncService::builder()
        .store(store.clone())
        .config(config)
        .build()
        .await
        .unwrap();

    let report = service.reconcile_all().await.unwrap();
    assert_eq!(report.successful, 3);
    assert_eq!(store.snapshot("business").len(), 3);
}

#[tokio::test]
async fn test_bulk_reconcile_fails_when_listing_fails() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T1", "Anna").await;
    store.fail_collection("identity", StoreFault::Remote("503".to_string()));
    let service = service_over(store).await;

    assert!(matches!(
        service.reconcile_all().await,
        Err(SyncError::Remote(_))
    ));
}

#[tokio::test]
async fn test_reverse_sync_only_touches_allowed_fields() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T1", "Anna").await;
    let service = service_over(store.clone()).await;

    let applied = service
        .reconcile_reverse(
            "T1",
            &record(json!({ "displayName": "Anna B.", "dailyTarget": 9, "deviceId": "dev-7" })),
        )
        .await
        .unwrap();
    assert!(applied);

    let identities = store.snapshot("identity");
    let identity = &identities[0];
    assert_eq!(identity["displayName"], "Anna B.");
    assert_eq!(identity["deviceId"], "dev-7");
    assert!(identity.get("dailyTarget").is_none());

    let nothing = service
        .reconcile_reverse("T1", &record(json!({ "dailyTarget": 3 })))
        .await
        .unwrap();
    assert!(!nothing);
}

#[tokio::test(start_paused = true)]
async fn test_failed_sync_backs_off_linearly_then_fails() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = SyncService::builder()
        .store(Arc::new(InMemoryRecordStore::new()))
        .fetch(failing_fetch(calls.clone()))
        .build()
        .await
        .unwrap();
    let mut rx = event_channel(&service);

    let started = tokio::time::Instant::now();
    let outcome = service.trigger_sync_now(false).await;

    assert!(!outcome.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(15_000));

    let events = drain(&mut rx);
    let delays: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::SyncRetry { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![5_000, 10_000, 15_000]);

    let failed: Vec<_> = events
        .iter()
        .filter(|event| event.name() == "sync_failed")
        .collect();
    assert_eq!(
        failed,
        vec![&SyncEvent::SyncFailed {
            consecutive_errors: 1,
            error: "Network error: upstream unreachable".to_string(),
        }]
    );
    assert_eq!(service.status().consecutive_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_consecutive_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = SyncConfig::default();
    config.scheduler.max_attempts = 1;
    config.scheduler.max_consecutive_errors = 3;
    config.scheduler.min_delay_secs = 0;
    let service = SyncService::builder()
        .store(Arc::new(InMemoryRecordStore::new()))
        .config(config)
        .fetch(failing_fetch(calls.clone()))
        .build()
        .await
        .unwrap();
    let mut rx = event_channel(&service);

    service.start_scheduler(Some(1)).await.unwrap();
    loop {
        if let SyncEvent::CircuitOpen { consecutive_errors } = rx.recv().await.unwrap() {
            assert_eq!(consecutive_errors, 3);
            break;
        }
    }

    assert_eq!(service.status().state, SchedulerState::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let outcome = service.trigger_sync_now(false).await;
    assert_eq!(outcome.reason(), Some(SkipReason::MaxErrorsReached));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // the timer stays halted
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_min_delay_throttles_unless_forced() {
    let calls = Arc::new(AtomicUsize::new(0));
    let clock = Arc::new(ManualClock::default());
    let service = SyncService::builder()
        .store(Arc::new(InMemoryRecordStore::new()))
        .clock(clock.clone())
        .fetch(counting_fetch(calls.clone()))
        .build()
        .await
        .unwrap();

    assert!(service.trigger_sync_now(false).await.is_success());
    clock.advance(chrono::Duration::seconds(10));

    let throttled = service.trigger_sync_now(false).await;
    assert_eq!(throttled.reason(), Some(SkipReason::MinDelay));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(service.trigger_sync_now(true).await.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_offline_attempt_is_not_counted_as_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let network = NetworkStatus::new(false);
    let service = SyncService::builder()
        .store(Arc::new(InMemoryRecordStore::new()))
        .network(network.clone())
        .fetch(failing_fetch(calls.clone()))
        .build()
        .await
        .unwrap();
    let mut rx = event_channel(&service);

    let outcome = service.trigger_sync_now(false).await;
    assert_eq!(outcome.reason(), Some(SkipReason::NoNetwork));

    let forced = service.trigger_sync_now(true).await;
    assert_eq!(forced.reason(), Some(SkipReason::NoNetwork));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(service.status().consecutive_errors, 0);
    assert!(drain(&mut rx)
        .iter()
        .all(|event| *event == SyncEvent::NetworkOffline));
}

#[tokio::test]
async fn test_default_fetch_reconciles_active_drivers() {
    let store = Arc::new(InMemoryRecordStore::new());
    seed_identity(&store, "T1", "Anna").await;
    seed_identity(&store, "T2", "Ben").await;
    let service = service_over(store.clone()).await;

    let outcome = service.trigger_sync_now(false).await;
    assert!(outcome.is_success());
    assert_eq!(store.snapshot("business").len(), 2);
    assert!(service.status().last_sync_time.is_some());
}

#[tokio::test]
async fn test_error_count_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::default();
    config.state.db_path = dir.path().join("state.db").to_string_lossy().into_owned();
    config.scheduler.max_attempts = 1;

    let calls = Arc::new(AtomicUsize::new(0));
    {
        let state_store = Arc::new(SqliteScheduleStore::connect(&config.state).await.unwrap());
        let service = SyncService::builder()
            .store(Arc::new(InMemoryRecordStore::new()))
            .config(config.clone())
            .state_store(state_store)
            .fetch(failing_fetch(calls.clone()))
            .build()
            .await
            .unwrap();

        service.trigger_sync_now(false).await;
        service.trigger_sync_now(false).await;
        assert_eq!(service.status().consecutive_errors, 2);
    }

    let state_store = Arc::new(SqliteScheduleStore::connect(&config.state).await.unwrap());
    let service = SyncService::builder()
        .store(Arc::new(InMemoryRecordStore::new()))
        .config(config)
        .state_store(state_store)
        .fetch(failing_fetch(calls))
        .build()
        .await
        .unwrap();

    assert_eq!(service.status().consecutive_errors, 2);
    assert_eq!(service.status().state, SchedulerState::Stopped);
}
