use crate::core::{
    Event, EventId, EventPayload, MethodInstance, Point, Result, Run, RunConfig, RunId, RunStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Latest event written to the store and the run it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventNotice {
    pub run_id: RunId,
    pub event_id: EventId,
}

/// Storage engine trait - allows pluggable persistence backends.
///
/// One writer per run (its worker) and any number of concurrent readers.
/// Every write is atomic and durable before it returns.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run in `queued` status. Fails if the id is taken.
    async fn create_run(&self, run_id: RunId, request: &RunConfig) -> Result<Run>;

    /// Move a run along its lifecycle. Entering a terminal status stamps
    /// `finished_at`; `error` replaces the stored message.
    async fn set_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run>;

    /// Append to the run's event log and return the assigned identifier.
    async fn append_event(&self, payload: EventPayload) -> Result<EventId>;

    /// Move the payload's run to a terminal `status` and append the terminal
    /// event. Backends that can should make both visible at once, so a
    /// reader never sees a terminal run whose closing event is missing.
    async fn finish_run(
        &self,
        status: RunStatus,
        error: Option<String>,
        payload: EventPayload,
    ) -> Result<(Run, EventId)> {
        let run = self.set_run_status(payload.run_id(), status, error).await?;
        let id = self.append_event(payload).await?;
        Ok((run, id))
    }

    /// Insert or update by `(run_id, method_id)`. An update only replaces
    /// status, metrics and runtime.
    async fn upsert_method(&self, method: MethodInstance) -> Result<()>;

    /// Insert or overwrite by `(run_id, method_id, step)`.
    async fn upsert_point(&self, point: Point) -> Result<()>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;

    /// All method instances of a run keyed by instance id.
    async fn get_methods(&self, run_id: RunId) -> Result<BTreeMap<String, MethodInstance>>;

    /// Events with `id > since`, ascending, at most `limit`.
    async fn fetch_events_since(
        &self,
        run_id: RunId,
        since: EventId,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// All points of a run ordered by `(method_id, step)`.
    async fn fetch_points(&self, run_id: RunId) -> Result<Vec<Point>>;

    /// Delete every run finished strictly before `cutoff`, cascading to its
    /// methods, events and points. Returns the number of runs removed.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Change feed carrying the latest event notice, if the backend has one.
    fn subscribe_events(&self) -> Option<watch::Receiver<EventNotice>> {
        None
    }
}
