use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use groupcal_sync::{
    AddOutcome, CalendarEvent, Connectivity, EngineConfig, EventDraft, EventIdKind, EventOrigin,
    EventPatch, FileStorage, KeyValueStorage, ManualConnectivity, MemoryBackend, MemoryStorage,
    MonthKey, OfflineQueue, RawDocument, StaticAuth, SyncEngine, SyncError,
};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

struct Harness<S> {
    backend: Arc<MemoryBackend>,
    connectivity: Arc<ManualConnectivity>,
    engine: SyncEngine<MemoryBackend, S>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(state: Connectivity) -> Harness<MemoryStorage> {
    harness_with(Arc::new(MemoryBackend::new()), Arc::new(MemoryStorage::new()), state)
}

fn harness_with<S: KeyValueStorage>(
    backend: Arc<MemoryBackend>,
    storage: Arc<S>,
    state: Connectivity,
) -> Harness<S> {
    init_tracing();
    let connectivity = Arc::new(ManualConnectivity::new(state));
    let engine = SyncEngine::start(
        EngineConfig::default(),
        backend.clone(),
        storage,
        connectivity.clone(),
        Arc::new(StaticAuth::signed_in("u1")),
    );
    Harness {
        backend,
        connectivity,
        engine,
    }
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Let spawned listener and watcher tasks run.
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Wait until the connectivity watcher has drained the offline queue.
async fn drained<S: KeyValueStorage>(engine: &SyncEngine<MemoryBackend, S>) {
    for _ in 0..50 {
        if engine.pending_mutations().await.unwrap().is_empty() {
            break;
        }
        settle().await;
    }
    assert!(engine.pending_mutations().await.unwrap().is_empty());
}

async fn month_ids<S: KeyValueStorage>(
    engine: &SyncEngine<MemoryBackend, S>,
    month: MonthKey,
) -> Vec<String> {
    let mut ids: Vec<String> = engine
        .get_events_for_month("u1", month.year, month.month)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    ids.sort();
    ids
}

async fn created<S: KeyValueStorage>(
    engine: &SyncEngine<MemoryBackend, S>,
    draft: EventDraft,
) -> String {
    match engine.add(draft).await.unwrap() {
        AddOutcome::Created { id } => id,
        other => panic!("expected a created event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_online_add_yields_exactly_one_record() {
    let h = harness(Connectivity::Online);
    h.backend.add_membership("g1", "u1", Some("#aa0000"));
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    let id = created(
        &h.engine,
        EventDraft::new("Planning", date("2025-04-14")).in_group("g1"),
    )
    .await;
    settle().await;

    let events = h.engine.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, id);
    assert_eq!(events[0].color, "#aa0000");

    let month = h.engine.get_events_for_month("u1", 2025, 4).await.unwrap();
    assert_eq!(month.len(), 1);
    assert_eq!(month[0].id, id);
    assert_eq!(month[0].title, "Planning");
    assert_eq!(month[0].group_id, "g1");

    handle.teardown();
    h.engine.dispose();
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let h = harness(Connectivity::Online);
    h.backend.add_membership("g1", "u1", None);

    let first = h.engine.subscribe("u1", false).await.unwrap();
    let second = h.engine.subscribe("u1", false).await.unwrap();
    assert_eq!(h.engine.subscription_refs("u1"), 2);
    assert_eq!(h.backend.listen_calls(), 2);

    first.teardown();
    first.teardown();
    settle().await;
    assert_eq!(h.engine.subscription_refs("u1"), 1);
    assert_eq!(h.backend.active_listeners(), 2);

    second.teardown();
    second.teardown();
    settle().await;
    assert_eq!(h.engine.subscription_refs("u1"), 0);
    assert_eq!(h.backend.active_listeners(), 0);
}

#[tokio::test]
async fn test_inverted_date_range_is_corrected() {
    let h = harness(Connectivity::Online);
    let id = created(
        &h.engine,
        EventDraft::new("Conference", date("2025-03-10")).ending(date("2025-03-05")),
    )
    .await;

    let event = h.engine.events().into_iter().find(|e| e.id == id).unwrap();
    assert_eq!(event.end_date, date("2025-03-10"));
    assert!(!event.is_multi_day);

    let document = h.backend.document(&id).unwrap();
    assert_eq!(document["endDate"], json!("2025-03-10"));
    assert_eq!(document["isMultiDay"], json!(false));
}

#[tokio::test]
async fn test_duplicate_submissions_create_one_event() {
    let h = harness(Connectivity::Online);
    let draft = EventDraft::new("Standup", date("2025-04-01")).in_group("g1");

    let (first, second) = tokio::join!(h.engine.add(draft.clone()), h.engine.add(draft));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, AddOutcome::Duplicate))
            .count(),
        1
    );
    assert_eq!(h.backend.document_count(), 1);
    assert_eq!(h.engine.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_window_expires() {
    let h = harness(Connectivity::Online);
    let draft = EventDraft::new("Standup", date("2025-04-01"));

    created(&h.engine, draft.clone()).await;
    assert_eq!(h.engine.add(draft.clone()).await.unwrap(), AddOutcome::Duplicate);

    tokio::time::advance(Duration::from_secs(3)).await;
    created(&h.engine, draft).await;
    assert_eq!(h.backend.document_count(), 2);
}

#[tokio::test]
async fn test_offline_update_round_trip() {
    let h = harness(Connectivity::Online);
    let id = created(&h.engine, EventDraft::new("Lunch", date("2025-04-02"))).await;

    h.connectivity.set(Connectivity::Offline);
    settle().await;
    h.engine.update(&id, EventPatch::title("X")).await.unwrap();

    let event = h.engine.events().into_iter().find(|e| e.id == id).unwrap();
    assert_eq!(event.title, "X");
    assert_eq!(h.engine.pending_mutations().await.unwrap().len(), 1);
    assert_eq!(h.backend.document(&id).unwrap()["title"], json!("Lunch"));

    h.connectivity.set(Connectivity::Online);
    drained(&h.engine).await;
    assert_eq!(h.backend.document(&id).unwrap()["title"], json!("X"));
}

#[tokio::test]
async fn test_offline_add_is_reconciled_after_reconnect() {
    let h = harness(Connectivity::Offline);
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    let outcome = h
        .engine
        .add(EventDraft::new("Flight", date("2025-04-20")).ending(date("2025-04-22")))
        .await
        .unwrap();
    let AddOutcome::Queued { offline_id } = outcome else {
        panic!("expected the add to be queued");
    };
    h.engine
        .update(&offline_id, EventPatch::title("Flight home"))
        .await
        .unwrap();
    assert_eq!(h.engine.pending_mutations().await.unwrap().len(), 1);

    let report = h.engine.flush_offline_queue().await.unwrap();
    assert_eq!(report.replayed, 0);

    h.connectivity.set(Connectivity::Online);
    drained(&h.engine).await;
    settle().await;

    let events = h.engine.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id_kind(), EventIdKind::Durable);
    assert_eq!(events[0].title, "Flight home");
    assert!(events[0].is_multi_day);
    assert_eq!(h.backend.document_count(), 1);

    handle.teardown();
}

#[tokio::test]
async fn test_failed_add_rolls_back_and_notifies() {
    let h = harness(Connectivity::Online);
    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let sink = seen.clone();
    let registration = h.engine.register_callback(move |events: &[CalendarEvent]| {
        let ids = events.iter().map(|e| e.id.clone()).collect();
        sink.lock().unwrap().push(ids);
    });

    h.backend.fail_next_writes(1);
    let err = h
        .engine
        .add(EventDraft::new("Doomed", date("2025-04-03")))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::WriteFailure(_)));
    assert!(h.engine.events().is_empty());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0][0].starts_with("temp_"));
    assert!(seen[1].is_empty());
    registration.unregister();
}

#[tokio::test]
async fn test_failed_update_and_remove_roll_back() {
    let h = harness(Connectivity::Online);
    let id = created(&h.engine, EventDraft::new("Lunch", date("2025-04-02"))).await;
    let before = h.engine.events();

    h.backend.fail_next_writes(2);
    assert!(h.engine.update(&id, EventPatch::title("Brunch")).await.is_err());
    assert_eq!(h.engine.events(), before);

    assert!(h.engine.remove(&id).await.is_err());
    assert_eq!(h.engine.events(), before);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_month_reads_share_one_fetch() {
    let h = harness(Connectivity::Online);
    h.backend.put_document(
        "e1",
        fields(json!({ "title": "Dentist", "startDate": "2025-04-09", "userId": "u1" })),
    );
    h.backend.set_fetch_delay(Some(Duration::from_millis(200)));

    let (a, b) = tokio::join!(
        h.engine.get_events_for_month("u1", 2025, 4),
        h.engine.get_events_for_month("u1", 2025, 4)
    );
    assert_eq!(a.unwrap().len(), 1);
    assert_eq!(b.unwrap().len(), 1);
    assert_eq!(h.backend.fetch_calls(), 1);

    // Fresh within the TTL, refetched after it
    h.engine.get_events_for_month("u1", 2025, 4).await.unwrap();
    assert_eq!(h.backend.fetch_calls(), 1);
    tokio::time::advance(Duration::from_secs(301)).await;
    h.engine.get_events_for_month("u1", 2025, 4).await.unwrap();
    assert_eq!(h.backend.fetch_calls(), 2);
}

#[tokio::test]
async fn test_invalid_month_is_rejected() {
    let h = harness(Connectivity::Online);
    let err = h.engine.get_events_for_month("u1", 2025, 13).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidMonth { month: 13, .. }));
}

#[tokio::test]
async fn test_group_color_propagates_without_network() {
    let h = harness(Connectivity::Online);
    h.backend.add_membership("g1", "u1", Some("#aa0000"));
    h.backend.add_membership("g2", "u1", Some("#00aa00"));
    for (id, group) in [("a", "g1"), ("b", "g1"), ("c", "g2")] {
        h.backend.put_document(
            id,
            fields(json!({
            "title": id,
            "startDate": "2025-04-01",
            "userId": "u2",
            "groupId": group
        })),
        );
    }
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    let listens = h.backend.listen_calls();
    let memberships = h.backend.membership_calls();
    h.engine.update_group_color("g1", "#112233");

    for event in h.engine.events() {
        let expected = if event.group_id == "g1" { "#112233" } else { "#00aa00" };
        assert_eq!(event.color, expected, "event {}", event.id);
    }
    assert_eq!(h.backend.listen_calls(), listens);
    assert_eq!(h.backend.membership_calls(), memberships);
    assert_eq!(h.backend.fetch_calls(), 0);

    handle.teardown();
}

#[tokio::test]
async fn test_live_query_error_keeps_events() {
    let h = harness(Connectivity::Online);
    h.backend.put_document(
        "mine",
        fields(json!({ "title": "Mine", "startDate": "2025-04-02", "userId": "u1" })),
    );
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    h.backend.emit_error("permission denied");
    settle().await;
    assert_eq!(h.engine.events().len(), 1);

    handle.teardown();
}

#[tokio::test]
async fn test_clear_all_cache_and_state() {
    let h = harness(Connectivity::Online);
    h.backend.put_document(
        "mine",
        fields(json!({ "title": "Mine", "startDate": "2025-04-02", "userId": "u1" })),
    );
    let _handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;
    h.connectivity.set(Connectivity::Offline);
    settle().await;
    h.engine
        .add(EventDraft::new("Queued", date("2025-04-03")))
        .await
        .unwrap();

    h.engine.clear_all_cache_and_state().await.unwrap();
    settle().await;

    assert!(h.engine.events().is_empty());
    assert!(h.engine.pending_mutations().await.unwrap().is_empty());
    assert_eq!(h.engine.active_user(), None);
    assert_eq!(h.backend.active_listeners(), 0);
}

#[tokio::test]
async fn test_queue_survives_restart_with_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());

    let first = harness_with(
        backend.clone(),
        Arc::new(FileStorage::new(dir.path())),
        Connectivity::Offline,
    );
    first
        .engine
        .add(EventDraft::new("Offline note", date("2025-04-05")))
        .await
        .unwrap();
    first.engine.dispose();
    drop(first);
    assert_eq!(backend.document_count(), 0);

    let second = harness_with(
        backend.clone(),
        Arc::new(FileStorage::new(dir.path())),
        Connectivity::Online,
    );
    drained(&second.engine).await;
    assert_eq!(backend.document_count(), 1);
    second.engine.dispose();
    assert!(second.engine.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_ahead_of_write_confirmation_yields_one_record() {
    let h = harness(Connectivity::Online);
    h.backend.add_membership("g1", "u1", None);
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    let largest: Arc<Mutex<usize>> = Arc::default();
    let sink = largest.clone();
    let registration = h.engine.register_callback(move |events: &[CalendarEvent]| {
        let mut largest = sink.lock().unwrap();
        *largest = (*largest).max(events.len());
    });

    h.backend.set_ack_delay(Some(Duration::from_millis(50)));
    let draft = EventDraft::new("Retro", date("2025-04-18")).in_group("g1");
    let (outcome, mid_write) = tokio::join!(h.engine.add(draft), async {
        tokio::time::sleep(Duration::from_millis(25)).await;
        h.engine.events()
    });
    let AddOutcome::Created { id } = outcome.unwrap() else {
        panic!("expected a created event");
    };

    // The group stream delivered the durable record before the write returned
    assert_eq!(mid_write.len(), 1);
    assert_eq!(mid_write[0].id, id);

    settle().await;
    let events = h.engine.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, id);
    assert_eq!(*largest.lock().unwrap(), 1);

    registration.unregister();
    handle.teardown();
}

#[tokio::test]
async fn test_event_reported_by_both_queries_appears_once() {
    let h = harness(Connectivity::Online);
    h.backend.add_membership("g1", "u1", None);
    let shared = fields(json!({
        "title": "Offsite",
        "startDate": "2025-04-22",
        "userId": "u1",
        "groupId": "g1"
    }));
    h.backend.put_document("shared", shared.clone());
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    // A lagging personal replica still reports the event
    h.backend
        .deliver_snapshot(EventOrigin::Personal, vec![RawDocument::new("shared", shared)]);
    settle().await;

    let events = h.engine.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "shared");
    assert_eq!(events[0].title, "Offsite");

    handle.teardown();
}

#[tokio::test]
async fn test_offline_changes_survive_live_snapshots() {
    let h = harness(Connectivity::Online);
    for (id, title) in [("e1", "Lunch"), ("e3", "Gym")] {
        h.backend.put_document(
            id,
            fields(json!({ "title": title, "startDate": "2025-04-02", "userId": "u1" })),
        );
    }
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    h.connectivity.set(Connectivity::Offline);
    settle().await;
    h.engine.update("e1", EventPatch::title("X")).await.unwrap();
    h.engine.remove("e3").await.unwrap();

    // Another client writes while this one is offline
    h.backend.put_document(
        "e2",
        fields(json!({ "title": "Dinner", "startDate": "2025-04-03", "userId": "u1" })),
    );
    settle().await;

    let titles = |engine: &SyncEngine<MemoryBackend, MemoryStorage>| {
        let mut titles: Vec<String> = engine.events().into_iter().map(|e| e.title).collect();
        titles.sort();
        titles
    };
    assert_eq!(titles(&h.engine), vec!["Dinner", "X"]);
    assert_eq!(h.engine.pending_mutations().await.unwrap().len(), 2);

    h.connectivity.set(Connectivity::Online);
    drained(&h.engine).await;
    settle().await;

    assert_eq!(h.backend.document("e1").unwrap()["title"], json!("X"));
    assert!(h.backend.document("e3").is_none());
    assert_eq!(titles(&h.engine), vec!["Dinner", "X"]);

    handle.teardown();
}

#[tokio::test]
async fn test_month_read_falls_back_to_cache_when_fetch_fails() {
    let backend = Arc::new(MemoryBackend::new());
    let storage = Arc::new(MemoryStorage::new());
    let this_month = MonthKey::current();
    let next_month = this_month.next();
    backend.put_document(
        "spanning",
        fields(json!({
            "title": "Night shift",
            "startDate": this_month.last_day().to_string(),
            "endDate": next_month.first_day().to_string(),
            "userId": "u1"
        })),
    );

    let h = harness_with(backend.clone(), storage.clone(), Connectivity::Online);
    let handle = h.engine.subscribe("u1", false).await.unwrap();
    settle().await;

    // A new session without live queries reads the persisted cache only
    let cold = harness_with(backend.clone(), storage, Connectivity::Online);
    backend.fail_next_fetches(1);
    assert_eq!(month_ids(&cold.engine, next_month).await, vec!["spanning"]);

    h.connectivity.set(Connectivity::Offline);
    settle().await;
    let outcome = h
        .engine
        .add(EventDraft::new("Handover", next_month.first_day()))
        .await
        .unwrap();
    let AddOutcome::Queued { offline_id } = outcome else {
        panic!("expected the add to be queued");
    };

    backend.fail_next_fetches(1);
    let mut expected = vec![offline_id, "spanning".to_string()];
    expected.sort();
    assert_eq!(month_ids(&h.engine, next_month).await, expected);

    handle.teardown();
    cold.engine.dispose();
}

#[tokio::test]
async fn test_start_with_file_storage_uses_configured_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        storage_dir: dir.path().join("store"),
        ..Default::default()
    };
    let engine = SyncEngine::start_with_file_storage(
        config,
        Arc::new(MemoryBackend::new()),
        Arc::new(ManualConnectivity::new(Connectivity::Offline)),
        Arc::new(StaticAuth::signed_in("u1")),
    );
    engine
        .add(EventDraft::new("Offline note", date("2025-04-05")))
        .await
        .unwrap();
    engine.dispose();

    let persisted = OfflineQueue::new(Arc::new(FileStorage::new(dir.path().join("store"))));
    assert_eq!(persisted.len().await.unwrap(), 1);
}

