use rpa_core::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Value under {key} is not usable: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Compare-and-set on {key} did not settle after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl StoreError {
    /// Transient failures worth retrying from the caller's loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Contention { .. })
    }
}
