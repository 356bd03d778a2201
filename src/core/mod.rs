pub mod error;
pub mod run_config;
pub mod types;
pub mod value;

pub use error::{Result, StoreError};
pub use run_config::{LORENZ96_MODEL, RunConfig, StageSpec};
pub use types::{
    EVENT_ID_KEY, Event, EventId, EventKind, EventPayload, MethodInstance, MethodStatus, Metrics,
    Point, PointSample, Run, RunId, RunStatus,
};
pub use value::{ParamValue, Params};
