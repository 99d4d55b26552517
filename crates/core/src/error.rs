#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A broken invariant. Never retried; callers log and stop.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
