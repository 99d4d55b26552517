//! Selection of the [`StateStore`] backend from configuration.

use std::sync::Arc;

use rpa_core::error::CoreError;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::postgres::PgStore;
use crate::store::StateStore;

/// Backend for the shared state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateStoreKind {
    Postgres { database_url: String },
    /// Process-local; only useful when every component runs in one process.
    Memory,
}

impl StateStoreKind {
    /// Read `STATE_STORE` (`postgres` by default) and, for postgres,
    /// `DATABASE_URL`.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup("STATE_STORE").as_deref().unwrap_or("postgres") {
            "postgres" => Ok(StateStoreKind::Postgres {
                database_url: lookup("DATABASE_URL").ok_or_else(|| {
                    CoreError::Validation("DATABASE_URL must be set when STATE_STORE=postgres".into())
                })?,
            }),
            "memory" => Ok(StateStoreKind::Memory),
            other => Err(CoreError::Validation(format!(
                "STATE_STORE must be postgres or memory, got '{other}'"
            ))),
        }
    }

    /// Open the backend. Postgres is health-checked and migrated first.
    pub async fn connect(&self) -> Result<Arc<dyn StateStore>, StoreError> {
        match self {
            StateStoreKind::Postgres { database_url } => {
                let pool = crate::create_pool(database_url).await?;
                crate::health_check(&pool).await?;
                crate::run_migrations(&pool)
                    .await
                    .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))?;
                tracing::info!("State store ready (postgres)");
                Ok(Arc::new(PgStore::new(pool)))
            }
            StateStoreKind::Memory => {
                tracing::warn!("Using the in-process state store");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use assert_matches::assert_matches;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn postgres_is_the_default_and_needs_a_url() {
        assert_matches!(
            StateStoreKind::from_lookup(&lookup(&[])),
            Err(CoreError::Validation(msg)) if msg.contains("DATABASE_URL")
        );
        assert_eq!(
            StateStoreKind::from_lookup(&lookup(&[("DATABASE_URL", "postgres://localhost/rpa")])).unwrap(),
            StateStoreKind::Postgres {
                database_url: "postgres://localhost/rpa".into()
            }
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert_matches!(
            StateStoreKind::from_lookup(&lookup(&[("STATE_STORE", "redis")])),
            Err(CoreError::Validation(_))
        );
    }

    #[tokio::test]
    async fn memory_backend_connects() {
        let store = StateStoreKind::Memory.connect().await.unwrap();
        store.ping().await.unwrap();
    }
}
