use rpa_core::types::ServiceId;
use serde::{Deserialize, Serialize};

/// A browser session living on one execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationSession {
    pub service_id: ServiceId,
    pub endpoint: String,
    pub session_id: String,
}
