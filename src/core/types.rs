use super::run_config::RunConfig;
use super::value::Params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

pub type RunId = Uuid;

/// Store-assigned event identifier. Strictly increasing, never reused.
pub type EventId = u64;

/// Reserved payload key carrying the event identifier on delivery.
pub const EVENT_ID_KEY: &str = "_event_id";

// ============================================================================
// Run
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed lifecycle edges: queued -> running -> {completed, failed}.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly when `status` becomes terminal.
    pub finished_at: Option<DateTime<Utc>>,
    pub request: RunConfig,
    pub error: Option<String>,
}

// ============================================================================
// MethodInstance
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodStatus {
    Running,
    Completed,
}

/// Summary metrics of one completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "final")]
    pub final_error: f64,
    pub mean: f64,
    pub min: f64,
    pub rmse_a: f64,
    pub rmse_b: f64,
    pub background_final: f64,
    pub background_mean: f64,
    pub background_min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInstance {
    pub run_id: RunId,
    pub method_id: String,
    pub name: String,
    pub label: String,
    pub params: Params,
    pub status: MethodStatus,
    pub metrics: Option<Metrics>,
    pub runtime_sec: Option<f64>,
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    RunStarted,
    MethodStarted,
    Partial,
    MethodCompleted,
    RunCompleted,
    RunFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunStarted => "run_started",
            Self::MethodStarted => "method_started",
            Self::Partial => "partial",
            Self::MethodCompleted => "method_completed",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
        }
    }

    /// `run_completed` and `run_failed` close every stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific event body. Serialized with a `type` tag so the JSON a
/// client receives is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunCreated {
        run_id: RunId,
        request: RunConfig,
        ts: DateTime<Utc>,
    },
    RunStarted {
        run_id: RunId,
        ts: DateTime<Utc>,
    },
    MethodStarted {
        run_id: RunId,
        method_id: String,
        name: String,
        label: String,
        params: Params,
        ts: DateTime<Utc>,
    },
    Partial {
        run_id: RunId,
        method_id: String,
        name: String,
        label: String,
        step: u32,
        t: f64,
        error_a: f64,
        error_b: f64,
        ts: DateTime<Utc>,
    },
    MethodCompleted {
        run_id: RunId,
        method_id: String,
        name: String,
        label: String,
        metrics: Metrics,
        runtime_sec: f64,
        ts: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        ts: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        error: String,
        ts: DateTime<Utc>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunCreated { .. } => EventKind::RunCreated,
            Self::RunStarted { .. } => EventKind::RunStarted,
            Self::MethodStarted { .. } => EventKind::MethodStarted,
            Self::Partial { .. } => EventKind::Partial,
            Self::MethodCompleted { .. } => EventKind::MethodCompleted,
            Self::RunCompleted { .. } => EventKind::RunCompleted,
            Self::RunFailed { .. } => EventKind::RunFailed,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunStarted { run_id, .. }
            | Self::MethodStarted { run_id, .. }
            | Self::Partial { run_id, .. }
            | Self::MethodCompleted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => *run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub run_id: RunId,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// JSON body delivered to stream clients: the payload plus `_event_id`.
    pub fn to_json(&self) -> JsonValue {
        let mut body = serde_json::to_value(&self.payload).unwrap_or_else(|_| JsonValue::Object(Default::default()));
        if let JsonValue::Object(map) = &mut body {
            map.insert(EVENT_ID_KEY.to_string(), JsonValue::from(self.id));
        }
        body
    }
}

// ============================================================================
// Point
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointSample {
    pub step: u32,
    pub t: f64,
    pub error_b: f64,
    pub error_a: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub run_id: RunId,
    pub method_id: String,
    pub step: u32,
    pub t: f64,
    pub error_b: f64,
    pub error_a: f64,
}

impl Point {
    pub fn new(run_id: RunId, method_id: impl Into<String>, sample: PointSample) -> Self {
        Self {
            run_id,
            method_id: method_id.into(),
            step: sample.step,
            t: sample.t,
            error_b: sample.error_b,
            error_a: sample.error_a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn event_json_carries_type_and_event_id() {
        let run_id = Uuid::new_v4();
        let event = Event {
            id: 42,
            run_id,
            kind: EventKind::RunFailed,
            payload: EventPayload::RunFailed {
                run_id,
                error: "boom".to_string(),
                ts: Utc::now(),
            },
            created_at: Utc::now(),
        };

        let body = event.to_json();
        assert_eq!(body["type"], "run_failed");
        assert_eq!(body["error"], "boom");
        assert_eq!(body[EVENT_ID_KEY], 42);
        assert_eq!(body["run_id"], run_id.to_string());
    }
}
