//! Provider automation seam.
//!
//! A provider automation knows how to log in and run one action inside an
//! [`AutomationSession`]. The processor owns sessions, codes and
//! bookkeeping; automations only drive the browser.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rpa_browser::{AutomationSession, ExecutionUnitManager};
use rpa_core::job::PendingJob;
use rpa_core::types::provider_key;

use crate::credentials::Credentials;
use crate::error::AutomationError;
use crate::portal::CommandPortal;

#[async_trait]
pub trait ProviderAutomation: Send + Sync {
    fn provider(&self) -> &str;

    /// Authenticate the session. `totp_code` is `None` for providers that
    /// do not use one.
    async fn login(
        &self,
        units: &ExecutionUnitManager,
        session: &AutomationSession,
        credentials: &Credentials,
        totp_code: Option<&str>,
    ) -> Result<(), AutomationError>;

    /// Run `action` for one job. Returns
    /// [`AutomationError::SessionInvalid`] when the provider logged the
    /// session out.
    async fn execute(
        &self,
        units: &ExecutionUnitManager,
        session: &AutomationSession,
        action: &str,
        job: &PendingJob,
    ) -> Result<serde_json::Value, AutomationError>;
}

/// Automations by provider name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    automations: HashMap<String, Arc<dyn ProviderAutomation>>,
    passthrough: bool,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve unregistered providers with a [`CommandPortal`].
    pub fn with_passthrough() -> Self {
        Self {
            automations: HashMap::new(),
            passthrough: true,
        }
    }

    pub fn register(&mut self, automation: Arc<dyn ProviderAutomation>) {
        self.automations
            .insert(provider_key(automation.provider()), automation);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAutomation>> {
        match self.automations.get(&provider_key(provider)) {
            Some(automation) => Some(Arc::clone(automation)),
            None if self.passthrough => Some(Arc::new(CommandPortal::new(provider))),
            None => None,
        }
    }
}
