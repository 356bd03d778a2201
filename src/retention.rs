use crate::config::RetentionConfig;
use crate::core::Result;
use crate::storage::RunStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Delete every run that finished more than `ttl` before `now`. Unfinished
/// runs are never touched.
pub async fn sweep_once(store: &dyn RunStore, ttl: Duration, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    store.delete_finished_before(cutoff).await
}

/// Background loop running [`sweep_once`] every `interval`.
pub struct RetentionSweeper {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl RetentionSweeper {
    pub fn spawn(store: Arc<dyn RunStore>, config: RetentionConfig) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let interval = config.interval.max(Duration::from_millis(10));

        let join_handle = tokio::spawn(async move {
            info!(
                ttl_secs = config.ttl.as_secs(),
                interval_secs = interval.as_secs_f64(),
                "retention sweeper started"
            );
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        match sweep_once(store.as_ref(), config.ttl, Utc::now()).await {
                            Ok(0) => debug!("retention sweep found nothing to delete"),
                            Ok(deleted) => info!(deleted, "retention sweep deleted finished runs"),
                            Err(err) => warn!(error = %err, "retention sweep failed"),
                        }
                    }
                }
            }
            debug!("retention sweeper stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            if let Err(err) = join_handle.await {
                warn!(error = %err, "retention sweeper join failed");
            }
        }
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventPayload, RunConfig, RunId, RunStatus};
    use crate::storage::JournaledStore;
    use uuid::Uuid;

    async fn finished_run(store: &JournaledStore) -> RunId {
        let run_id = Uuid::new_v4();
        store.create_run(run_id, &RunConfig::default()).await.unwrap();
        store
            .set_run_status(run_id, RunStatus::Running, None)
            .await
            .unwrap();
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
            .unwrap();
        run_id
    }

    #[tokio::test]
    async fn test_sweep_respects_ttl() {
        let store = JournaledStore::in_memory();
        let run_id = finished_run(&store).await;
        let ttl = Duration::from_secs(3600);

        assert_eq!(sweep_once(&store, ttl, Utc::now()).await.unwrap(), 0);
        assert!(store.get_run(run_id).await.unwrap().is_some());

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(sweep_once(&store, ttl, later).await.unwrap(), 1);
        assert!(store.get_run(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_never_deletes_active_runs() {
        let store = JournaledStore::in_memory();
        let queued = Uuid::new_v4();
        store.create_run(queued, &RunConfig::default()).await.unwrap();
        let running = Uuid::new_v4();
        store.create_run(running, &RunConfig::default()).await.unwrap();
        store
            .set_run_status(running, RunStatus::Running, None)
            .await
            .unwrap();

        let far_future = Utc::now() + chrono::Duration::days(3650);
        assert_eq!(sweep_once(&store, Duration::ZERO, far_future).await.unwrap(), 0);
        assert!(store.get_run(queued).await.unwrap().is_some());
        assert!(store.get_run(running).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweeper_loop_deletes_and_stops() {
        let store = Arc::new(JournaledStore::in_memory());
        let run_id = finished_run(&store).await;

        let sweeper = RetentionSweeper::spawn(
            Arc::clone(&store) as Arc<dyn RunStore>,
            RetentionConfig::default()
                .ttl(Duration::ZERO)
                .interval(Duration::from_millis(10)),
        );

        let mut deleted = false;
        for _ in 0..100 {
            if store.get_run(run_id).await.unwrap().is_none() {
                deleted = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        sweeper.stop().await;
        assert!(deleted);
    }
}
