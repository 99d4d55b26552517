//! Provider login credentials from `{PROVIDER}_USERNAME` / `{PROVIDER}_PASSWORD`.

use std::collections::HashMap;
use std::fmt;

use rpa_core::types::provider_key;

const USERNAME_SUFFIX: &str = "_USERNAME";
const PASSWORD_SUFFIX: &str = "_PASSWORD";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials keyed by lower-cased provider name.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    by_provider: HashMap<String, Credentials>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Providers need both variables set to be picked up.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut store = Self::new();
        for (key, username) in &vars {
            let Some(provider) = key.strip_suffix(USERNAME_SUFFIX) else {
                continue;
            };
            if provider.is_empty() {
                continue;
            }
            if let Some(password) = vars.get(&format!("{provider}{PASSWORD_SUFFIX}")) {
                store.insert(provider, username.clone(), password.clone());
            }
        }
        store
    }

    pub fn insert(&mut self, provider: &str, username: impl Into<String>, password: impl Into<String>) {
        self.by_provider.insert(
            provider_key(provider),
            Credentials {
                username: username.into(),
                password: password.into(),
            },
        );
    }

    pub fn get(&self, provider: &str) -> Option<&Credentials> {
        self.by_provider.get(&provider_key(provider))
    }

    pub fn len(&self) -> usize {
        self.by_provider.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_provider.is_empty()
    }
}
