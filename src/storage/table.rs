use super::persistence::WalEntry;
use crate::core::{Event, EventId, MethodInstance, Point, Run, RunId, RunStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;

type MethodKey = (RunId, String);
type EventKey = (RunId, EventId);
type PointKey = (RunId, String, u32);

/// The four relations, each keyed by its composite primary key so that
/// range scans return rows in the order readers need.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    runs: BTreeMap<RunId, Run>,
    methods: BTreeMap<MethodKey, MethodInstance>,
    events: BTreeMap<EventKey, Event>,
    points: BTreeMap<PointKey, Point>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(
        runs: Vec<Run>,
        methods: Vec<MethodInstance>,
        events: Vec<Event>,
        points: Vec<Point>,
    ) -> Self {
        let mut tables = Self::new();
        for run in runs {
            tables.runs.insert(run.run_id, run);
        }
        for method in methods {
            tables.methods.insert((method.run_id, method.method_id.clone()), method);
        }
        for event in events {
            tables.events.insert((event.run_id, event.id), event);
        }
        for point in points {
            tables
                .points
                .insert((point.run_id, point.method_id.clone(), point.step), point);
        }
        tables
    }

    pub fn run(&self, run_id: &RunId) -> Option<&Run> {
        self.runs.get(run_id)
    }

    pub fn contains_run(&self, run_id: &RunId) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn method(&self, run_id: RunId, method_id: &str) -> Option<&MethodInstance> {
        self.methods.get(&(run_id, method_id.to_string()))
    }

    pub fn methods_for(&self, run_id: RunId) -> impl Iterator<Item = &MethodInstance> {
        self.methods
            .range((run_id, String::new())..)
            .take_while(move |((owner, _), _)| *owner == run_id)
            .map(|(_, method)| method)
    }

    pub fn events_since(
        &self,
        run_id: RunId,
        since: EventId,
        limit: usize,
    ) -> impl Iterator<Item = &Event> {
        self.events
            .range((
                Bound::Excluded((run_id, since)),
                Bound::Included((run_id, EventId::MAX)),
            ))
            .take(limit)
            .map(|(_, event)| event)
    }

    pub fn points_for(&self, run_id: RunId) -> impl Iterator<Item = &Point> {
        self.points
            .range((run_id, String::new(), 0)..)
            .take_while(move |((owner, _, _), _)| *owner == run_id)
            .map(|(_, point)| point)
    }

    /// Runs whose finish timestamp is strictly older than `cutoff`.
    /// Unfinished runs never qualify.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<RunId> {
        self.runs
            .values()
            .filter(|run| run.finished_at.is_some_and(|finished| finished < cutoff))
            .map(|run| run.run_id)
            .collect()
    }

    /// Runs still `queued` or `running`, with their current status.
    pub fn unfinished_runs(&self) -> Vec<(RunId, RunStatus)> {
        self.runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .map(|run| (run.run_id, run.status))
            .collect()
    }

    pub fn max_event_id(&self) -> Option<EventId> {
        self.events.values().map(|event| event.id).max()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Apply one already-validated journal entry. Shared by the live write
    /// path and crash recovery, so both produce identical tables.
    pub fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::CreateRun(run) => {
                self.runs.insert(run.run_id, run);
            }
            WalEntry::SetRunStatus {
                run_id,
                status,
                error,
                finished_at,
            } => {
                if let Some(run) = self.runs.get_mut(&run_id) {
                    run.status = status;
                    run.error = error;
                    if finished_at.is_some() {
                        run.finished_at = finished_at;
                    }
                }
            }
            WalEntry::AppendEvent(event) => {
                self.events.insert((event.run_id, event.id), event);
            }
            WalEntry::UpsertMethod(method) => {
                let key = (method.run_id, method.method_id.clone());
                match self.methods.get_mut(&key) {
                    Some(existing) => {
                        existing.status = method.status;
                        existing.metrics = method.metrics;
                        existing.runtime_sec = method.runtime_sec;
                    }
                    None => {
                        self.methods.insert(key, method);
                    }
                }
            }
            WalEntry::UpsertPoint(point) => {
                self.points
                    .insert((point.run_id, point.method_id.clone(), point.step), point);
            }
            WalEntry::DeleteRuns { run_ids } => {
                for run_id in run_ids {
                    self.remove_run(run_id);
                }
            }
            WalEntry::Batch(entries) => {
                for entry in entries {
                    self.apply(entry);
                }
            }
        }
    }

    fn remove_run(&mut self, run_id: RunId) {
        self.runs.remove(&run_id);

        let method_keys: Vec<MethodKey> = self
            .methods
            .range((run_id, String::new())..)
            .take_while(|((owner, _), _)| *owner == run_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in method_keys {
            self.methods.remove(&key);
        }

        let event_keys: Vec<EventKey> = self
            .events
            .range((run_id, 0)..=(run_id, EventId::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in event_keys {
            self.events.remove(&key);
        }

        let point_keys: Vec<PointKey> = self
            .points
            .range((run_id, String::new(), 0)..)
            .take_while(|((owner, _, _), _)| *owner == run_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in point_keys {
            self.points.remove(&key);
        }
    }

    /// Flatten into row lists for snapshotting.
    pub fn to_rows(&self) -> (Vec<Run>, Vec<MethodInstance>, Vec<Event>, Vec<Point>) {
        (
            self.runs.values().cloned().collect(),
            self.methods.values().cloned().collect(),
            self.events.values().cloned().collect(),
            self.points.values().cloned().collect(),
        )
    }
}
