//! Shared state store and job intake adapters.
//!
//! Every piece of global mutable coordination state lives behind
//! [`StateStore`]. The typed repositories in [`repositories`] are the only
//! code that knows the key layout and the JSON encoding of records.

pub mod backend;
pub mod cas;
pub mod error;
pub mod intake;
pub mod memory;
pub mod postgres;
pub mod repositories;
pub mod store;

pub use backend::StateStoreKind;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{Expiry, StateStore};

use sqlx::postgres::PgPoolOptions;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded migrations under `crates/store/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
