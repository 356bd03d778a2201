use crate::core::StoreError;
use crate::engine::EngineError;
use crate::export::ExportError;
use crate::runner::RunError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Store(StoreError),
    Input(String),
    NotFound(String),
    Internal(String),
}

impl From<StoreError> for WebError {
    fn from(err: StoreError) -> Self {
        WebError::Store(err)
    }
}

impl From<RunError> for WebError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::InvalidConfig(message) => Self::Input(message),
            RunError::Engine(err @ (EngineError::UnknownAlgorithm(_)
            | EngineError::InvalidParameter { .. })) => Self::Input(err.to_string()),
            RunError::Engine(err) => Self::Internal(err.to_string()),
            RunError::Store(err) => Self::Store(err),
            RunError::Join(message) => Self::Internal(message),
        }
    }
}

impl From<ExportError> for WebError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::RunNotFound(_) => Self::NotFound(err.to_string()),
            ExportError::NoData(_) => Self::Input(err.to_string()),
            ExportError::Store(err) => Self::Store(err),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::Store(StoreError::RunNotFound(_)) => (
                StatusCode::NOT_FOUND,
                "run not found".to_string(),
                "not_found",
            ),
            WebError::Store(err @ (StoreError::RunExists(_) | StoreError::InvalidTransition { .. })) => {
                (StatusCode::CONFLICT, err.to_string(), "conflict")
            }
            WebError::Store(err) => {
                error!(error = %err, "storage failure while serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                    "storage_error",
                )
            }
            WebError::Input(msg) => (StatusCode::BAD_REQUEST, msg, "input_error"),
            WebError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found"),
            WebError::Internal(msg) => {
                error!(error = %msg, "internal failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, msg, "internal_error")
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;
