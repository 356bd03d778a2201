use super::engine::{EventNotice, RunStore};
use super::persistence::{DurabilityMode, PersistenceManager, WalEntry};
use super::table::TableSet;
use crate::config::StorageConfig;
use crate::core::{
    Event, EventId, EventPayload, MethodInstance, Point, Result, Run, RunConfig, RunId, RunStatus,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

/// Run store backed by in-memory tables and an optional write-ahead log.
///
/// Writers serialize on the journal mutex: validate, log, then apply. Event
/// ids are assigned under the same mutex, so id order equals log order.
/// Readers only take the table lock and never wait on disk I/O.
pub struct JournaledStore {
    tables: RwLock<TableSet>,
    journal: Mutex<Journal>,
    latest_event: watch::Sender<EventNotice>,
}

struct Journal {
    persistence: Option<PersistenceManager>,
    next_event_id: EventId,
}

/// Error recorded on runs whose worker died with the previous process.
pub const INTERRUPTED_RUN_ERROR: &str = "interrupted by restart";

/// Row counts across all runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub runs: usize,
    pub events: usize,
    pub points: usize,
}

impl JournaledStore {
    /// Volatile store, nothing touches disk.
    pub fn in_memory() -> Self {
        Self::from_parts(TableSet::new(), None, 1)
    }

    /// Open the store described by `config`, recovering any state on disk.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if config.durability == DurabilityMode::None {
            info!("run store opened in memory");
            return Ok(Self::in_memory());
        }

        let mut persistence = PersistenceManager::new(&config.data_dir, config.durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(config.checkpoint_entries);

        let mut recovered = persistence.recover()?;
        let interrupted =
            fail_interrupted_runs(&mut recovered.tables, &mut recovered.next_event_id);
        info!(
            data_dir = %config.data_dir.display(),
            runs = recovered.tables.run_count(),
            events = recovered.tables.event_count(),
            replayed = recovered.replayed_entries,
            interrupted,
            "run store recovered"
        );

        // Compact right away; this also makes the interrupted-run failures durable.
        persistence.checkpoint(&recovered.tables, recovered.next_event_id)?;

        Ok(Self::from_parts(
            recovered.tables,
            Some(persistence),
            recovered.next_event_id,
        ))
    }

    fn from_parts(
        tables: TableSet,
        persistence: Option<PersistenceManager>,
        next_event_id: EventId,
    ) -> Self {
        let (latest_event, _) = watch::channel(EventNotice {
            run_id: RunId::nil(),
            event_id: next_event_id.saturating_sub(1),
        });
        Self {
            tables: RwLock::new(tables),
            journal: Mutex::new(Journal {
                persistence,
                next_event_id,
            }),
            latest_event,
        }
    }

    /// Snapshot the tables and truncate the WAL.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut journal = self.journal.lock().await;
        let next_event_id = journal.next_event_id;
        if let Some(persistence) = journal.persistence.as_mut() {
            let tables = self.tables.read().await;
            persistence.checkpoint(&tables, next_event_id)?;
            debug!(runs = tables.run_count(), "run store checkpointed");
        }
        Ok(())
    }

    pub async fn stats(&self) -> StoreStats {
        let tables = self.tables.read().await;
        StoreStats {
            runs: tables.run_count(),
            events: tables.event_count(),
            points: tables.point_count(),
        }
    }

    /// Log then apply. Caller holds the journal lock and has validated `entry`.
    async fn commit(&self, journal: &mut Journal, entry: WalEntry) -> Result<()> {
        if let Some(persistence) = journal.persistence.as_mut() {
            persistence.log(&entry)?;
        }

        self.tables.write().await.apply(entry);

        let next_event_id = journal.next_event_id;
        if let Some(persistence) = journal.persistence.as_mut() {
            if persistence.needs_checkpoint() {
                // Writers stay blocked on the journal lock; readers proceed.
                // A failed compaction leaves the WAL intact.
                let tables = self.tables.read().await;
                if let Err(err) = persistence.checkpoint(&tables, next_event_id) {
                    warn!(error = %err, "run store checkpoint failed");
                }
            }
        }
        Ok(())
    }

    async fn ensure_run(&self, run_id: RunId) -> Result<()> {
        if self.tables.read().await.contains_run(&run_id) {
            Ok(())
        } else {
            Err(StoreError::RunNotFound(run_id))
        }
    }
}

/// Fail every run left `queued` or `running` by a previous process, since no
/// worker will ever pick it up again. Each gets a `run_failed` event so open
/// streams terminate. Returns the number of runs touched.
fn fail_interrupted_runs(tables: &mut TableSet, next_event_id: &mut EventId) -> usize {
    let unfinished = tables.unfinished_runs();
    let now = Utc::now();
    for (run_id, status) in &unfinished {
        let run_id = *run_id;
        warn!(%run_id, %status, "failing run interrupted by restart");
        let payload = EventPayload::RunFailed {
            run_id,
            error: INTERRUPTED_RUN_ERROR.to_string(),
            ts: now,
        };
        let event = Event {
            id: *next_event_id,
            run_id,
            kind: payload.kind(),
            payload,
            created_at: now,
        };
        *next_event_id += 1;
        tables.apply(WalEntry::Batch(vec![
            WalEntry::SetRunStatus {
                run_id,
                status: RunStatus::Failed,
                error: Some(INTERRUPTED_RUN_ERROR.to_string()),
                finished_at: Some(now),
            },
            WalEntry::AppendEvent(event),
        ]));
    }
    unfinished.len()
}

impl Default for JournaledStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl RunStore for JournaledStore {
    async fn create_run(&self, run_id: RunId, request: &RunConfig) -> Result<Run> {
        let mut journal = self.journal.lock().await;
        if self.tables.read().await.contains_run(&run_id) {
            return Err(StoreError::RunExists(run_id));
        }

        let run = Run {
            run_id,
            status: RunStatus::Queued,
            created_at: Utc::now(),
            finished_at: None,
            request: request.clone(),
            error: None,
        };
        self.commit(&mut journal, WalEntry::CreateRun(run.clone()))
            .await?;
        Ok(run)
    }

    async fn set_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run> {
        let mut journal = self.journal.lock().await;
        let mut run = self
            .tables
            .read()
            .await
            .run(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))?;

        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: run.status,
                to: status,
            });
        }

        let finished_at = status.is_terminal().then(Utc::now);
        self.commit(
            &mut journal,
            WalEntry::SetRunStatus {
                run_id,
                status,
                error: error.clone(),
                finished_at,
            },
        )
        .await?;

        run.status = status;
        run.error = error;
        if finished_at.is_some() {
            run.finished_at = finished_at;
        }
        Ok(run)
    }

    async fn append_event(&self, payload: EventPayload) -> Result<EventId> {
        let mut journal = self.journal.lock().await;
        let run_id = payload.run_id();
        self.ensure_run(run_id).await?;

        // Taken before the write: an id that reached the log is never reissued.
        let id = journal.next_event_id;
        journal.next_event_id = id + 1;
        let event = Event {
            id,
            run_id,
            kind: payload.kind(),
            payload,
            created_at: Utc::now(),
        };
        self.commit(&mut journal, WalEntry::AppendEvent(event)).await?;
        self.latest_event.send_replace(EventNotice { run_id, event_id: id });
        Ok(id)
    }

    async fn finish_run(
        &self,
        status: RunStatus,
        error: Option<String>,
        payload: EventPayload,
    ) -> Result<(Run, EventId)> {
        let mut journal = self.journal.lock().await;
        let run_id = payload.run_id();
        let mut run = self
            .tables
            .read()
            .await
            .run(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))?;

        if !status.is_terminal() || !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: run.status,
                to: status,
            });
        }

        let now = Utc::now();
        let id = journal.next_event_id;
        journal.next_event_id = id + 1;
        let event = Event {
            id,
            run_id,
            kind: payload.kind(),
            payload,
            created_at: now,
        };
        self.commit(
            &mut journal,
            WalEntry::Batch(vec![
                WalEntry::SetRunStatus {
                    run_id,
                    status,
                    error: error.clone(),
                    finished_at: Some(now),
                },
                WalEntry::AppendEvent(event),
            ]),
        )
        .await?;
        self.latest_event.send_replace(EventNotice { run_id, event_id: id });

        run.status = status;
        run.error = error;
        run.finished_at = Some(now);
        Ok((run, id))
    }

    async fn upsert_method(&self, method: MethodInstance) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.ensure_run(method.run_id).await?;
        self.commit(&mut journal, WalEntry::UpsertMethod(method))
            .await
    }

    async fn upsert_point(&self, point: Point) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.ensure_run(point.run_id).await?;
        self.commit(&mut journal, WalEntry::UpsertPoint(point)).await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.tables.read().await.run(&run_id).cloned())
    }

    async fn get_methods(&self, run_id: RunId) -> Result<BTreeMap<String, MethodInstance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .methods_for(run_id)
            .map(|method| (method.method_id.clone(), method.clone()))
            .collect())
    }

    async fn fetch_events_since(
        &self,
        run_id: RunId,
        since: EventId,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let tables = self.tables.read().await;
        Ok(tables.events_since(run_id, since, limit).cloned().collect())
    }

    async fn fetch_points(&self, run_id: RunId) -> Result<Vec<Point>> {
        let tables = self.tables.read().await;
        Ok(tables.points_for(run_id).cloned().collect())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut journal = self.journal.lock().await;
        let run_ids = self.tables.read().await.finished_before(cutoff);
        if run_ids.is_empty() {
            return Ok(0);
        }

        let deleted = run_ids.len();
        self.commit(&mut journal, WalEntry::DeleteRuns { run_ids })
            .await?;
        Ok(deleted)
    }

    fn subscribe_events(&self) -> Option<watch::Receiver<EventNotice>> {
        Some(self.latest_event.subscribe())
    }
}
