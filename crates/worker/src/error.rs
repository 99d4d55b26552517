use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rpa_browser::ExecutionUnitError;
use rpa_core::batch::BatchFailure;
use rpa_core::error::CoreError;
use rpa_core::types::{BatchId, JobId};
use rpa_store::intake::IntakeError;
use rpa_store::StoreError;
use serde_json::json;

/// Errors raised by a provider automation.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    /// The provider no longer accepts the session.
    #[error("Session is no longer valid: {0}")]
    SessionInvalid(String),

    #[error("Login rejected: {0}")]
    LoginFailed(String),

    #[error("Automation step failed: {0}")]
    Step(String),

    #[error(transparent)]
    Unit(#[from] ExecutionUnitError),
}

/// Errors from batch processing.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The batch is owned by another worker, or no longer in progress.
    #[error("Batch {batch_id} is not in progress on this worker")]
    NotOwner { batch_id: BatchId },

    #[error("Job {job_id} is not part of batch {batch_id}")]
    UnknownJob { batch_id: BatchId, job_id: JobId },

    /// The batch failed as a whole; its unfinished jobs went back to pending.
    #[error("Batch {batch_id} failed: {failure:?}")]
    BatchFailed {
        batch_id: BatchId,
        failure: BatchFailure,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Unit(#[from] ExecutionUnitError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ProcessorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessorError::Store(e) => e.is_retryable(),
            ProcessorError::Intake(e) => e.is_retryable(),
            ProcessorError::Unit(e) => e.is_retryable(),
            ProcessorError::NotOwner { .. }
            | ProcessorError::UnknownJob { .. }
            | ProcessorError::BatchFailed { .. }
            | ProcessorError::Core(_) => false,
        }
    }
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, ProcessorError>;

impl IntoResponse for ProcessorError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ProcessorError::NotOwner { .. } | ProcessorError::BatchFailed { .. } => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            ProcessorError::UnknownJob { .. } => (StatusCode::BAD_REQUEST, "UNKNOWN_JOB"),
            ProcessorError::Store(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ProcessorError::Core(CoreError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}
