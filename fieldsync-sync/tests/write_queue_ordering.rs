use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldsync_core::{MutationRequest, OperationKind, PriorityClass, SyncMode, SyncStatus};
use fieldsync_sync::{
    memory::{MemoryLocalStore, MemoryRemoteStore, ToggleConnectivity},
    write_queue::QUEUE_KEY,
    SkipReason, WriteQueue,
};
use serde_json::json;

struct Harness {
    queue: Arc<WriteQueue>,
    remote: Arc<MemoryRemoteStore>,
    net: ToggleConnectivity,
}

fn harness(retry_ceiling: u32) -> Harness {
    let net = ToggleConnectivity::new(true);
    let remote = Arc::new(MemoryRemoteStore::new(net.clone()));
    let queue = Arc::new(WriteQueue::new(
        remote.clone(),
        Arc::new(MemoryLocalStore::new()),
        Arc::new(net.clone()),
        retry_ceiling,
    ));
    Harness { queue, remote, net }
}

fn create(priority: PriorityClass, path: &str) -> MutationRequest {
    MutationRequest::new(priority, path, OperationKind::Create, json!({ "name": path }))
}

// ---------------------------------------------------------------------------
// 1. Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_pass_dispatches_by_class_then_fifo() {
    let h = harness(5);
    for (priority, path) in [
        (PriorityClass::P2, "a"),
        (PriorityClass::P0, "b"),
        (PriorityClass::P1, "c"),
        (PriorityClass::P0, "d"),
    ] {
        h.queue.enqueue(create(priority, path)).await.expect("enqueue");
    }

    let report = h.queue.sync_queue(SyncMode::Full).await;

    assert_eq!(h.remote.accepted_paths(), vec!["b", "d", "c", "a"]);
    assert_eq!(report.succeeded.len(), 4);
    assert!(h.queue.entries().await.is_empty());
    assert_eq!(report.status.pending_count, 0);
}

#[tokio::test]
async fn interleaved_classes_drain_strictly_in_class_order() {
    let h = harness(5);
    let plan = [
        PriorityClass::P3,
        PriorityClass::P1,
        PriorityClass::P3,
        PriorityClass::P0,
        PriorityClass::P2,
        PriorityClass::P1,
        PriorityClass::P0,
        PriorityClass::P2,
    ];
    for (i, priority) in plan.iter().enumerate() {
        h.queue
            .enqueue(create(*priority, &format!("{priority}-{i}")))
            .await
            .expect("enqueue");
    }

    h.queue.sync_queue(SyncMode::Full).await;

    assert_eq!(
        h.remote.accepted_paths(),
        vec!["P0-3", "P0-6", "P1-1", "P1-5", "P2-4", "P2-7", "P3-0", "P3-2"]
    );
}

#[tokio::test]
async fn operations_map_to_remote_calls() {
    let h = harness(5);
    h.remote.insert_document("doc", json!({"a": 1, "b": 1}));
    h.queue
        .enqueue(MutationRequest::new(
            PriorityClass::P1,
            "doc",
            OperationKind::Update,
            json!({"b": 2}),
        ))
        .await
        .expect("enqueue update");
    h.queue
        .enqueue(MutationRequest::new(
            PriorityClass::P1,
            "gone",
            OperationKind::Delete,
            json!(null),
        ))
        .await
        .expect("enqueue delete");

    h.queue.sync_queue(SyncMode::Full).await;

    assert_eq!(h.remote.document("doc"), Some(json!({"a": 1, "b": 2})));
    let ops: Vec<OperationKind> = h.remote.dispatch_log().iter().map(|d| d.operation).collect();
    assert_eq!(ops, vec![OperationKind::Update, OperationKind::Delete]);
}

// ---------------------------------------------------------------------------
// 2. Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_reflects_enqueue_before_any_network_call() {
    let h = harness(5);
    h.net.set(false);
    let seen: Arc<Mutex<Vec<SyncStatus>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _handle = h.queue.subscribe(move |s| sink.lock().unwrap().push(s.clone()));

    h.queue
        .enqueue(create(PriorityClass::P3, "photo"))
        .await
        .expect("enqueue");

    let status = h.queue.status();
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.p3_count, 1);
    assert!(h.remote.dispatch_log().is_empty());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().map(|s| s.pending_count), Some(0), "replayed on subscribe");
    assert_eq!(seen.last().map(|s| s.pending_count), Some(1));
}

#[tokio::test]
async fn is_syncing_is_broadcast_during_pass() {
    let h = harness(5);
    h.queue
        .enqueue(create(PriorityClass::P0, "a"))
        .await
        .expect("enqueue");
    let flags: Arc<Mutex<Vec<bool>>> = Arc::default();
    let sink = Arc::clone(&flags);
    let _handle = h
        .queue
        .subscribe(move |s| sink.lock().unwrap().push(s.is_syncing));

    h.queue.sync_queue(SyncMode::Critical).await;

    let flags = flags.lock().unwrap();
    assert!(flags.contains(&true));
    assert_eq!(flags.last(), Some(&false));
}

// ---------------------------------------------------------------------------
// 3. Failures and retry ceiling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_failure_does_not_halt_batch() {
    let h = harness(5);
    h.remote.fail_path("b", None);
    for path in ["a", "b", "c"] {
        h.queue
            .enqueue(create(PriorityClass::P1, path))
            .await
            .expect("enqueue");
    }

    let report = h.queue.sync_queue(SyncMode::Full).await;

    assert_eq!(h.remote.accepted_paths(), vec!["a", "c"]);
    assert_eq!(report.retrying.len(), 1);
    let left = h.queue.entries().await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].attempt_count, 1);
    assert!(left[0].last_error.as_deref().unwrap_or("").contains("injected"));
}

#[tokio::test]
async fn entry_past_ceiling_is_only_retried_explicitly() {
    let h = harness(3);
    h.remote.fail_path("flaky", None);
    h.queue
        .enqueue(create(PriorityClass::P0, "flaky"))
        .await
        .expect("enqueue");

    for _ in 0..3 {
        h.queue.sync_queue(SyncMode::Full).await;
    }
    let status = h.queue.status();
    assert_eq!((status.failed_count, status.pending_count), (1, 0));

    let attempts_before = h.remote.dispatch_log().len();
    let report = h.queue.sync_queue(SyncMode::Full).await;
    assert!(report.dispatched.is_empty());
    assert_eq!(h.remote.dispatch_log().len(), attempts_before);

    h.remote.clear_failures();
    let report = h.queue.retry_failed_items().await.expect("retry");
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(h.queue.status().failed_count, 0);
    assert!(h.queue.entries().await.is_empty());
}

#[tokio::test]
async fn clear_discards_failed_without_replay() {
    let h = harness(1);
    h.remote.fail_path("x", None);
    h.queue
        .enqueue(create(PriorityClass::P2, "x"))
        .await
        .expect("enqueue");
    h.queue
        .enqueue(create(PriorityClass::P2, "y"))
        .await
        .expect("enqueue");
    h.queue.sync_queue(SyncMode::Full).await;
    let attempts = h.remote.dispatch_log().len();

    assert_eq!(h.queue.clear_failed_items().await.expect("clear"), 1);
    assert_eq!(h.remote.dispatch_log().len(), attempts);
    assert!(h.queue.failed_items().await.is_empty());
}

// ---------------------------------------------------------------------------
// 4. Coalescing and triggers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true, flavor = "current_thread")]
async fn concurrent_passes_coalesce() {
    let h = harness(5);
    h.remote.set_latency(Some(Duration::from_millis(50)));
    for path in ["a", "b"] {
        h.queue
            .enqueue(create(PriorityClass::P0, path))
            .await
            .expect("enqueue");
    }

    let (first, second) = tokio::join!(
        h.queue.sync_queue(SyncMode::Full),
        h.queue.sync_queue(SyncMode::Full)
    );

    assert_eq!(first.succeeded.len(), 2);
    assert_eq!(second.skipped, Some(SkipReason::AlreadySyncing));
    assert_eq!(h.remote.dispatch_log().len(), 2, "each entry dispatched once");
}

#[tokio::test]
async fn scheduled_full_sync_waits_for_critical_pass() {
    let h = harness(5);
    h.queue
        .enqueue(create(PriorityClass::P3, "bulk"))
        .await
        .expect("enqueue");
    h.queue
        .enqueue(create(PriorityClass::P0, "urgent"))
        .await
        .expect("enqueue");
    assert!(!h.queue.has_completed_critical_pass());

    let report = h.queue.scheduled_full_sync().await;

    assert_eq!(report.mode, SyncMode::Full);
    assert_eq!(h.remote.accepted_paths(), vec!["urgent", "bulk"]);
    assert!(h.queue.has_completed_critical_pass());
}

#[tokio::test]
async fn reconnect_runs_critical_only() {
    let h = harness(5);
    h.net.set(false);
    h.queue.observe_connectivity(false).await;
    h.queue
        .enqueue(create(PriorityClass::P0, "safety"))
        .await
        .expect("enqueue");
    h.queue
        .enqueue(create(PriorityClass::P2, "routine"))
        .await
        .expect("enqueue");

    h.net.set(true);
    let report = h
        .queue
        .observe_connectivity(true)
        .await
        .expect("edge triggers a pass");

    assert_eq!(report.mode, SyncMode::Critical);
    assert_eq!(h.remote.accepted_paths(), vec!["safety"]);
    assert_eq!(h.queue.status().p2_count, 1);
}

#[tokio::test]
async fn unsaved_queue_after_dispatch_is_reported() {
    let net = ToggleConnectivity::new(true);
    let remote = Arc::new(MemoryRemoteStore::new(net.clone()));
    let local = Arc::new(MemoryLocalStore::new());
    let queue = WriteQueue::new(remote.clone(), local.clone(), Arc::new(net), 5);
    queue
        .enqueue(create(PriorityClass::P0, "first"))
        .await
        .expect("enqueue");
    queue
        .enqueue(create(PriorityClass::P0, "second"))
        .await
        .expect("enqueue");

    local.fail_writes_matching(Some(QUEUE_KEY));
    let report = queue.sync_queue(SyncMode::Full).await;

    assert!(report.persist_error.is_some());
    assert!(!report.completed());
    assert_eq!(remote.accepted_paths(), vec!["first"], "pass stops at the unsaved entry");
    assert!(!queue.has_completed_critical_pass());
    assert_eq!(queue.status().last_full_sync_at, None);

    local.fail_writes_matching(None);
    let report = queue.sync_queue(SyncMode::Full).await;
    assert!(report.completed());
    assert_eq!(remote.accepted_paths(), vec!["first", "second"]);
}
