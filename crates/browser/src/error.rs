use std::time::Duration;

use rpa_core::execution_unit::ExecutionUnitState;
use rpa_store::StoreError;

/// Errors from the execution-unit layer.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionUnitError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The control API or the unit returned a non-2xx status code.
    #[error("Execution-unit API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unit {service_id} not ready after {timeout:?}")]
    ReadyTimeout { service_id: String, timeout: Duration },

    #[error("Unit {service_id} is {state:?}")]
    Unavailable {
        service_id: String,
        state: ExecutionUnitState,
    },

    #[error("No execution unit became ready after {attempts} attempts")]
    ProvisioningExhausted { attempts: u32 },

    #[error("Unexpected response from unit: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutionUnitError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionUnitError::Request(_) | ExecutionUnitError::ReadyTimeout { .. } => true,
            ExecutionUnitError::Api { status, .. } => *status >= 500,
            ExecutionUnitError::Store(e) => e.is_retryable(),
            ExecutionUnitError::Unavailable { .. }
            | ExecutionUnitError::ProvisioningExhausted { .. }
            | ExecutionUnitError::InvalidResponse(_) => false,
        }
    }
}
