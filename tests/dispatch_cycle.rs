//! End-to-end dispatch scenarios: dispatcher, launcher and workers sharing
//! one SQLite queue.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{backdate_claims, enqueue_n, memory_store, RecordingLauncher, ScriptedProcessor};
use queue_dispatch::scheduler::shutdown;
use queue_dispatch::scheduler::{
    Dispatcher, DispatcherConfig, Shutdown, Worker, WorkerConfig, WorkerError, WorkerOutcome,
};
use queue_dispatch::storage::{EntryStatus, QueueStore, SqliteQueueStore};

fn dispatcher(
    store: &Arc<SqliteQueueStore>,
    launcher: &Arc<RecordingLauncher>,
    config: DispatcherConfig,
) -> Dispatcher {
    Dispatcher::new(store.clone(), launcher.clone(), config)
}

fn worker(
    store: &Arc<SqliteQueueStore>,
    processor: &Arc<ScriptedProcessor>,
    config: WorkerConfig,
) -> Worker {
    Worker::new(store.clone(), processor.clone(), config)
}

#[tokio::test]
async fn seventeen_rows_need_three_workers() {
    let store = memory_store().await;
    enqueue_n(&store, 17).await;
    let launcher = Arc::new(RecordingLauncher::new());
    let processor = Arc::new(ScriptedProcessor::new());

    let report = dispatcher(&store, &launcher, DispatcherConfig::new("test"))
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.pending_entries, 17);
    assert_eq!(report.workers_launched, 3);
    assert_eq!(report.launch_failures, 0);

    let requests = launcher.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.batch_size, 8);
        assert!(request.owner_id.starts_with("test-"));
    }

    // Run the launched workers the way the launcher would have.
    let mut claimed = 0;
    for request in requests {
        let config = WorkerConfig::new(request.owner_id).with_batch_size(request.batch_size);
        match worker(&store, &processor, config)
            .run(Shutdown::never())
            .await
            .unwrap()
        {
            WorkerOutcome::Processed(summary) => {
                assert_eq!(summary.failed, 0);
                claimed += summary.claimed;
            }
            WorkerOutcome::NoWork => panic!("every launched worker should find work"),
        }
    }

    assert_eq!(claimed, 17);
    assert_eq!(processor.calls(), 17);
    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.completed, 17);
    assert_eq!(counts.total(), 17);
}

#[tokio::test]
async fn partial_failure_does_not_affect_siblings() {
    let store = memory_store().await;
    let mut failing = Vec::new();
    for n in 0..5 {
        let id = store
            .enqueue(&serde_json::json!({ "n": n, "fail": n % 2 == 1 }))
            .await
            .unwrap();
        if n % 2 == 1 {
            failing.push(id);
        }
    }
    let processor = Arc::new(ScriptedProcessor::new());

    let outcome = worker(&store, &processor, WorkerConfig::new("w-partial"))
        .run(Shutdown::never())
        .await
        .unwrap();

    let WorkerOutcome::Processed(summary) = outcome else {
        panic!("expected a processed batch");
    };
    assert_eq!(summary.claimed, 5);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 2);

    for id in failing {
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, EntryStatus::Failed);
        assert_eq!(
            row.error_message.as_deref(),
            Some("External service returned status 500")
        );
        assert!(row.owner.is_none());
    }
    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.failed, 2);
}

#[tokio::test]
async fn invalid_payload_marks_row_failed() {
    let store = memory_store().await;
    let id = store.enqueue(&serde_json::json!("plain string")).await.unwrap();
    sqlx::query(&format!("UPDATE {} SET payload = 'not json' WHERE id = ?1", store.table()))
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();
    let processor = Arc::new(ScriptedProcessor::new());

    worker(&store, &processor, WorkerConfig::new("w-1"))
        .run(Shutdown::never())
        .await
        .unwrap();

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, EntryStatus::Failed);
    assert!(row.error_message.unwrap().starts_with("Invalid payload"));
    assert_eq!(processor.calls(), 0);
}

#[tokio::test]
async fn zero_load_launches_nothing() {
    let store = memory_store().await;
    let launcher = Arc::new(RecordingLauncher::new());

    let report = dispatcher(&store, &launcher, DispatcherConfig::new("test"))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.pending_entries, 0);
    assert_eq!(report.workers_launched, 0);
    assert!(report.workers.is_empty());
    assert!(launcher.requests().is_empty());
}

#[tokio::test]
async fn idle_worker_exits_without_work() {
    let store = memory_store().await;
    let processor = Arc::new(ScriptedProcessor::new());

    let outcome = worker(&store, &processor, WorkerConfig::new("w-idle"))
        .run(Shutdown::never())
        .await
        .unwrap();
    assert_eq!(outcome, WorkerOutcome::NoWork);
}

#[tokio::test]
async fn worker_count_is_capped() {
    let store = memory_store().await;
    enqueue_n(&store, 50).await;
    let launcher = Arc::new(RecordingLauncher::new());

    let config = DispatcherConfig::new("test")
        .with_batch_size(2)
        .with_max_workers(4);
    let report = dispatcher(&store, &launcher, config).run_cycle().await.unwrap();

    assert_eq!(report.pending_entries, 50);
    assert_eq!(report.workers_launched, 4);
    assert!(launcher.requests().iter().all(|r| r.batch_size == 2));
}

#[tokio::test]
async fn launch_failure_does_not_stop_remaining_launches() {
    let store = memory_store().await;
    enqueue_n(&store, 24).await;
    let launcher = Arc::new(RecordingLauncher::failing_at(vec![1]));

    let report = dispatcher(&store, &launcher, DispatcherConfig::new("test"))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(launcher.requests().len(), 3);
    assert_eq!(report.workers_launched, 2);
    assert_eq!(report.launch_failures, 1);
    assert_eq!(report.workers[0].handle, "fake-0");
    assert_eq!(report.workers[1].handle, "fake-2");

    let owners: Vec<String> = launcher.requests().into_iter().map(|r| r.owner_id).collect();
    assert_ne!(owners[0], owners[2]);
}

#[tokio::test]
async fn dispatch_cycle_reclaims_before_counting() {
    let store = memory_store().await;
    let ids = enqueue_n(&store, 4).await;
    store.claim_batch("crashed", 4).await.unwrap();
    backdate_claims(&store, &ids, Duration::from_secs(35 * 60)).await;
    let launcher = Arc::new(RecordingLauncher::new());

    let report = dispatcher(&store, &launcher, DispatcherConfig::new("test"))
        .run_cycle()
        .await
        .unwrap();

    assert_eq!(report.stale_entries_reset, 4);
    assert_eq!(report.pending_entries, 4);
    assert_eq!(report.workers_launched, 1);
}

#[tokio::test]
async fn retry_failed_is_opt_in() {
    let store = memory_store().await;
    let ids = enqueue_n(&store, 1).await;
    store.claim_batch("w-1", 1).await.unwrap();
    store.mark_failed(ids[0], "w-1", "boom").await.unwrap();
    let launcher = Arc::new(RecordingLauncher::new());

    let report = dispatcher(&store, &launcher, DispatcherConfig::new("test"))
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.requeued_failed, 0);
    assert_eq!(report.pending_entries, 0);

    let report = dispatcher(
        &store,
        &launcher,
        DispatcherConfig::new("test").with_retry_failed(true),
    )
    .run_cycle()
    .await
    .unwrap();
    assert_eq!(report.requeued_failed, 1);
    assert_eq!(report.pending_entries, 1);
    assert_eq!(report.workers_launched, 1);
}

#[tokio::test]
async fn shutdown_releases_unstarted_rows() {
    let store = memory_store().await;
    let ids = enqueue_n(&store, 3).await;
    let processor = Arc::new(ScriptedProcessor::new());
    let worker = worker(&store, &processor, WorkerConfig::new("w-stopping"));

    let claimed = store.claim_batch("w-stopping", 3).await.unwrap();
    let (trigger, shutdown) = shutdown::channel();
    trigger.trigger();

    let summary = worker.process_batch(claimed, &shutdown).await.unwrap();
    assert_eq!(summary.released, 3);
    assert_eq!(summary.completed, 0);
    assert_eq!(processor.calls(), 0);

    for id in ids {
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, EntryStatus::Pending);
        assert_eq!(row.retry_count, 0);
        assert!(row.owner.is_none());
    }
}

#[tokio::test]
async fn shutdown_mid_batch_lets_in_flight_calls_finish() {
    let store = memory_store().await;
    let ids = enqueue_n(&store, 3).await;
    let processor = Arc::new(ScriptedProcessor::slow(Duration::from_millis(200)));
    let config = WorkerConfig::new("w-draining").with_wall_clock_timeout(Duration::from_secs(5));

    let (trigger, shutdown) = shutdown::channel();
    let signal = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    });

    let outcome = worker(&store, &processor, config)
        .run(shutdown)
        .await
        .unwrap();
    signal.await.unwrap();

    let WorkerOutcome::Processed(summary) = outcome else {
        panic!("expected a processed batch");
    };
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.released, 0);
    assert_eq!(processor.calls(), 3);

    for id in ids {
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, EntryStatus::Completed);
        assert!(row.owner.is_none());
    }
}

#[tokio::test]
async fn shutdown_before_claim_claims_nothing() {
    let store = memory_store().await;
    enqueue_n(&store, 2).await;
    let processor = Arc::new(ScriptedProcessor::new());
    let (trigger, shutdown) = shutdown::channel();
    trigger.trigger();

    let outcome = worker(&store, &processor, WorkerConfig::new("w-1"))
        .run(shutdown)
        .await
        .unwrap();
    assert_eq!(outcome, WorkerOutcome::NoWork);
    assert_eq!(store.count_claimable().await.unwrap(), 2);
}

#[tokio::test]
async fn wall_clock_budget_abandons_rows_for_reclaim() {
    let store = memory_store().await;
    let ids = enqueue_n(&store, 2).await;
    let processor = Arc::new(ScriptedProcessor::slow(Duration::from_secs(5)));

    let config = WorkerConfig::new("w-slow").with_wall_clock_timeout(Duration::from_millis(100));
    let err = worker(&store, &processor, config)
        .run(Shutdown::never())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::WallClockExceeded(_)));

    for id in &ids {
        let row = store.get(*id).await.unwrap().unwrap();
        assert_eq!(row.status, EntryStatus::Processing);
        assert_eq!(row.owner.as_deref(), Some("w-slow"));
    }

    backdate_claims(&store, &ids, Duration::from_secs(31 * 60)).await;
    assert_eq!(
        store.reclaim_stale(Duration::from_secs(30 * 60)).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn loop_mode_stops_on_shutdown() {
    let store = memory_store().await;
    let launcher = Arc::new(RecordingLauncher::new());
    let dispatcher = dispatcher(
        &store,
        &launcher,
        DispatcherConfig::new("test").with_interval(Duration::from_millis(20)),
    );

    let (trigger, shutdown) = shutdown::channel();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    });

    tokio::time::timeout(Duration::from_secs(5), dispatcher.run_forever(shutdown))
        .await
        .expect("loop should stop after shutdown");
    stopper.await.unwrap();
}
