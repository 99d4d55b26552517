use rpa_core::error::CoreError;
use rpa_core::types::{BatchId, WorkerId};
use rpa_store::intake::IntakeError;
use rpa_store::StoreError;

/// Errors from the TOTP coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    /// Both the current and the next code were already reserved. The caller
    /// should try again later.
    #[error("No TOTP code available for provider {provider}")]
    CodeContention { provider: String },

    #[error("No TOTP secret configured for provider {0}")]
    NoSecret(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl TotpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TotpError::CodeContention { .. } => true,
            TotpError::Store(e) => e.is_retryable(),
            TotpError::NoSecret(_) | TotpError::Core(_) => false,
        }
    }
}

/// Errors talking to a worker.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Worker API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unknown worker {0}")]
    UnknownWorker(WorkerId),
}

/// Errors from batch dispatch and recovery.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Batch {batch_id} was not handed off after {attempts} attempts")]
    Exhausted { batch_id: BatchId, attempts: u32 },

    #[error("No worker available for batch {0}")]
    NoWorkers(BatchId),

    /// Another dispatcher claimed the batch, or it was aborted.
    #[error("Batch {batch_id} is no longer dispatchable ({reason})")]
    OwnershipLost { batch_id: BatchId, reason: String },

    #[error(transparent)]
    Totp(#[from] TotpError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::NoWorkers(_) => true,
            DispatchError::Totp(e) => e.is_retryable(),
            DispatchError::Intake(e) => e.is_retryable(),
            DispatchError::Store(e) => e.is_retryable(),
            DispatchError::Transport(_) => true,
            DispatchError::Exhausted { .. }
            | DispatchError::OwnershipLost { .. }
            | DispatchError::Core(_) => false,
        }
    }
}
