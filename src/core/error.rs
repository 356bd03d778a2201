use super::types::{RunId, RunStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run '{0}' already exists")]
    RunExists(RunId),

    #[error("Run '{0}' not found")]
    RunNotFound(RunId),

    #[error("Invalid status transition for run '{run_id}': {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
