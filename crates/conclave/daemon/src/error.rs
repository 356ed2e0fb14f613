//! Error types for conclave-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conclave_kernel_ledger::{AppendError, LedgerError};
use conclave_kernel_merkle::MerkleError;
use conclave_kernel_projection::ProjectionError;
use conclave_substrate::SubstrateError;
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Substrate(e) => substrate_status(e),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Substrate(SubstrateError::Append(AppendError::IllegalTransition {
                task_id,
                error,
            })) => Some(serde_json::json!({
                "task_id": task_id,
                "transition": error,
            })),
            ApiError::Substrate(SubstrateError::Append(AppendError::IntegrityLocked(fault)))
            | ApiError::Substrate(SubstrateError::Ledger(LedgerError::IntegrityLocked(fault))) => {
                serde_json::to_value(fault).ok()
            }
            _ => None,
        }
    }
}

fn substrate_status(error: &SubstrateError) -> (StatusCode, &'static str) {
    match error {
        SubstrateError::Halted(_) => (StatusCode::SERVICE_UNAVAILABLE, "HALTED"),
        SubstrateError::Append(e) => append_status(e),
        SubstrateError::Ledger(LedgerError::IntegrityLocked(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "INTEGRITY_LOCKED")
        }
        SubstrateError::Ledger(LedgerError::OutOfRange(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        SubstrateError::Merkle(MerkleError::UnknownEvent(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        SubstrateError::Merkle(MerkleError::NotYetSealed { .. }) => {
            (StatusCode::CONFLICT, "EPOCH_NOT_SEALED")
        }
        SubstrateError::Projection(ProjectionError::UnknownProjection(_)) => {
            (StatusCode::BAD_REQUEST, "UNKNOWN_PROJECTION")
        }
        SubstrateError::Halt(_) => (StatusCode::CONFLICT, "HALT_STATE"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

fn append_status(error: &AppendError) -> (StatusCode, &'static str) {
    match error {
        AppendError::IllegalTransition { .. } => (StatusCode::CONFLICT, "ILLEGAL_TRANSITION"),
        AppendError::UnknownEventType(_) => (StatusCode::UNPROCESSABLE_ENTITY, "UNKNOWN_EVENT_TYPE"),
        AppendError::UnknownActor(_) => (StatusCode::FORBIDDEN, "UNKNOWN_ACTOR"),
        AppendError::ActorNotPermitted { .. } => (StatusCode::FORBIDDEN, "ACTOR_NOT_PERMITTED"),
        AppendError::UnknownTask(_) => (StatusCode::NOT_FOUND, "UNKNOWN_TASK"),
        AppendError::DuplicateTask(_) => (StatusCode::CONFLICT, "DUPLICATE_TASK"),
        AppendError::DuplicateRecord { .. } => (StatusCode::CONFLICT, "DUPLICATE_RECORD"),
        AppendError::InvalidPayload { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_PAYLOAD"),
        AppendError::Band(_) => (StatusCode::CONFLICT, "ILLEGAL_BAND_CHANGE"),
        AppendError::Halted(_) => (StatusCode::SERVICE_UNAVAILABLE, "HALTED"),
        AppendError::IntegrityLocked(_) => (StatusCode::SERVICE_UNAVAILABLE, "INTEGRITY_LOCKED"),
        AppendError::HashChainBreak { .. } | AppendError::Storage(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            details: self.details(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
