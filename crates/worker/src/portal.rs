//! Generic automation that forwards commands to the execution unit.
//!
//! The unit runs the provider script; this side only sends `login` and
//! `execute` commands and interprets the replies.

use async_trait::async_trait;
use rpa_browser::{AutomationSession, ExecutionUnitManager};
use rpa_core::job::PendingJob;
use serde_json::{json, Value};

use crate::automation::ProviderAutomation;
use crate::credentials::Credentials;
use crate::error::AutomationError;

/// Error code a unit returns when the provider dropped the session.
pub const SESSION_INVALID: &str = "session_invalid";

pub struct CommandPortal {
    provider: String,
}

impl CommandPortal {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

/// Map an `{"error": ...}` reply onto an [`AutomationError`].
fn reply_error(reply: &Value, or_else: fn(String) -> AutomationError) -> Option<AutomationError> {
    let error = reply.get("error")?;
    let message = reply
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    if error.as_str() == Some(SESSION_INVALID) {
        return Some(AutomationError::SessionInvalid(message));
    }
    Some(or_else(message))
}

#[async_trait]
impl ProviderAutomation for CommandPortal {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn login(
        &self,
        units: &ExecutionUnitManager,
        session: &AutomationSession,
        credentials: &Credentials,
        totp_code: Option<&str>,
    ) -> Result<(), AutomationError> {
        let reply = units
            .command(
                session,
                json!({
                    "type": "login",
                    "provider": self.provider,
                    "username": credentials.username,
                    "password": credentials.password,
                    "totp_code": totp_code,
                }),
            )
            .await?;
        match reply_error(&reply, AutomationError::LoginFailed) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        units: &ExecutionUnitManager,
        session: &AutomationSession,
        action: &str,
        job: &PendingJob,
    ) -> Result<Value, AutomationError> {
        let reply = units
            .command(
                session,
                json!({
                    "type": "execute",
                    "provider": self.provider,
                    "action": action,
                    "job_id": job.id,
                    "parameters": job.parameters,
                }),
            )
            .await?;
        if let Some(e) = reply_error(&reply, AutomationError::Step) {
            return Err(e);
        }
        Ok(reply.get("result").cloned().unwrap_or(reply))
    }
}
