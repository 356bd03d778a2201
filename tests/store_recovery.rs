use assimrun::core::{MethodInstance, Params, Point, PointSample};
use assimrun::retention::sweep_once;
use assimrun::storage::memory::INTERRUPTED_RUN_ERROR;
use assimrun::storage::persistence::WAL_FILE_NAME;
use assimrun::{
    DurabilityMode, EventFeed, EventPayload, JournaledStore, MethodStatus, RunConfig, RunStatus,
    RunStore, StorageConfig, StreamConfig,
};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig::new(dir.path()).durability(DurabilityMode::Sync)
}

async fn seed_run(store: &JournaledStore) -> Uuid {
    let run_id = Uuid::new_v4();
    store
        .create_run(run_id, &RunConfig::default())
        .await
        .expect("create run");
    store
        .append_event(EventPayload::RunStarted {
            run_id,
            ts: Utc::now(),
        })
        .await
        .expect("append event");
    store
        .upsert_method(MethodInstance {
            run_id,
            method_id: "m1".to_string(),
            name: "enkf".to_string(),
            label: "enkf".to_string(),
            params: Params::new(),
            status: MethodStatus::Running,
            metrics: None,
            runtime_sec: None,
        })
        .await
        .expect("upsert method");
    for step in 0..3 {
        store
            .upsert_point(Point::new(
                run_id,
                "m1",
                PointSample {
                    step,
                    t: f64::from(step) * 0.1,
                    error_b: 0.4,
                    error_a: 0.2,
                },
            ))
            .await
            .expect("upsert point");
    }
    run_id
}

#[tokio::test]
async fn reopened_store_replays_the_write_ahead_log() {
    let dir = tempfile::tempdir().expect("temp dir");
    let run_id = {
        let store = JournaledStore::open(&config(&dir)).expect("open store");
        seed_run(&store).await
    };

    let store = JournaledStore::open(&config(&dir)).expect("reopen store");
    let run = store.get_run(run_id).await.unwrap().expect("run survives");
    assert_eq!(run.status, RunStatus::Failed);
    let events = store.fetch_events_since(run_id, 0, 10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind.as_str(), "run_started");
    assert_eq!(store.fetch_points(run_id).await.unwrap().len(), 3);
    assert_eq!(store.get_methods(run_id).await.unwrap()["m1"].status, MethodStatus::Running);
}

#[tokio::test]
async fn checkpointed_store_recovers_and_keeps_ids_monotonic() {
    let dir = tempfile::tempdir().expect("temp dir");
    let small_log = config(&dir).checkpoint_entries(2);

    let (first, last_id) = {
        let store = JournaledStore::open(&small_log).expect("open store");
        let first = seed_run(&store).await;
        let second = seed_run(&store).await;
        store
            .set_run_status(second, RunStatus::Running, None)
            .await
            .unwrap();
        let (_, last_id) = store
            .finish_run(
                RunStatus::Completed,
                None,
                EventPayload::RunCompleted {
                    run_id: second,
                    ts: Utc::now(),
                },
            )
            .await
            .unwrap();
        // Remove the run holding the newest event before shutting down.
        let deleted = store
            .delete_finished_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        store.checkpoint().await.unwrap();
        (first, last_id)
    };

    let store = JournaledStore::open(&small_log).expect("reopen store");
    assert_eq!(store.stats().await.runs, 1);
    assert_eq!(store.fetch_points(first).await.unwrap().len(), 3);

    let next_id = store
        .append_event(EventPayload::RunStarted {
            run_id: first,
            ts: Utc::now(),
        })
        .await
        .unwrap();
    assert!(next_id > last_id, "event id {next_id} reused after recovery");
}

#[tokio::test]
async fn terminal_status_and_event_survive_together() {
    let dir = tempfile::tempdir().expect("temp dir");
    let run_id = {
        let store = JournaledStore::open(&config(&dir)).expect("open store");
        let run_id = seed_run(&store).await;
        store
            .set_run_status(run_id, RunStatus::Running, None)
            .await
            .unwrap();
        store
            .finish_run(
                RunStatus::Failed,
                Some("boom".to_string()),
                EventPayload::RunFailed {
                    run_id,
                    error: "boom".to_string(),
                    ts: Utc::now(),
                },
            )
            .await
            .unwrap();
        run_id
    };

    let store = JournaledStore::open(&config(&dir)).expect("reopen store");
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("boom"));
    assert!(run.finished_at.is_some());

    let events = store.fetch_events_since(run_id, 0, 10).await.unwrap();
    assert_eq!(events.last().map(|e| e.kind.as_str()), Some("run_failed"));
}

#[tokio::test]
async fn memory_only_store_never_touches_disk() {
    let dir = tempfile::tempdir().expect("temp dir");
    let data_dir = dir.path().join("unused");
    let store = JournaledStore::open(
        &StorageConfig::new(&data_dir).durability(DurabilityMode::None),
    )
    .expect("open store");
    seed_run(&store).await;
    store.checkpoint().await.unwrap();
    assert!(!data_dir.exists());
}

#[tokio::test]
async fn interrupted_runs_fail_on_restart_and_close_their_streams() {
    let dir = tempfile::tempdir().expect("temp dir");
    let (queued, running) = {
        let store = JournaledStore::open(&config(&dir)).expect("open store");
        let queued = seed_run(&store).await;
        let running = seed_run(&store).await;
        store
            .set_run_status(running, RunStatus::Running, None)
            .await
            .unwrap();
        (queued, running)
    };

    let store = Arc::new(JournaledStore::open(&config(&dir)).expect("reopen store"));
    for run_id in [queued, running] {
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed, "run {run_id}");
        assert_eq!(run.error.as_deref(), Some(INTERRUPTED_RUN_ERROR));
        assert!(run.finished_at.is_some());
    }

    let mut feed = EventFeed::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        running,
        0,
        StreamConfig::default().poll_interval(Duration::from_millis(10)),
    );
    let mut names = Vec::new();
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(5), feed.next_frame())
        .await
        .expect("feed stalled")
    {
        names.push(frame.name());
    }
    assert_eq!(names, vec!["hello", "run_started", "run_failed", "done"]);

    let later = Utc::now() + chrono::Duration::minutes(1);
    assert_eq!(sweep_once(store.as_ref(), Duration::ZERO, later).await.unwrap(), 2);
    assert_eq!(store.stats().await.runs, 0);
}

#[tokio::test]
async fn acknowledged_write_after_a_partial_frame_survives_reopen() {
    let dir = tempfile::tempdir().expect("temp dir");
    let run_id = {
        let store = JournaledStore::open(&config(&dir)).expect("open store");
        let run_id = seed_run(&store).await;
        store
            .set_run_status(run_id, RunStatus::Running, None)
            .await
            .unwrap();

        // What a failed append leaves behind: a length prefix with half a body.
        let mut wal = OpenOptions::new()
            .append(true)
            .open(dir.path().join(WAL_FILE_NAME))
            .expect("open wal");
        wal.write_all(&64u32.to_le_bytes()).unwrap();
        wal.write_all(&[0x80, 0x81]).unwrap();
        drop(wal);

        store
            .finish_run(
                RunStatus::Completed,
                None,
                EventPayload::RunCompleted {
                    run_id,
                    ts: Utc::now(),
                },
            )
            .await
            .expect("finish after partial frame");
        run_id
    };

    let store = JournaledStore::open(&config(&dir)).expect("reopen store");
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error.is_none());
    let events = store.fetch_events_since(run_id, 0, 10).await.unwrap();
    assert_eq!(events.last().map(|e| e.kind.as_str()), Some("run_completed"));
}
