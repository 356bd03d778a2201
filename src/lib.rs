// ============================================================================
// assimrun: data-assimilation run service
// ============================================================================

pub mod app;
pub mod config;
pub mod core;
pub mod engine;
pub mod export;
pub mod retention;
pub mod runner;
pub mod storage;
pub mod stream;
pub mod web;

pub use config::{AppConfig, RetentionConfig, StorageConfig, StreamConfig, WorkerConfig};
pub use core::{
    Event, EventId, EventKind, EventPayload, MethodInstance, MethodStatus, Metrics, Point, Result,
    Run, RunConfig, RunId, RunStatus, StageSpec, StoreError,
};
pub use engine::{AnalysisRegistry, EngineError};
pub use retention::RetentionSweeper;
pub use runner::{RunError, RunOrchestrator, RunTicket};
pub use storage::{DurabilityMode, EventNotice, JournaledStore, RunStore};
pub use stream::{EventFeed, StreamFrame};
pub use web::{AppState, WebError, build_router};
