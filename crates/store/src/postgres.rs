//! [`StateStore`] on a single Postgres table.
//!
//! Atomicity comes from single-statement upserts and conditional updates on
//! the `kv_entries` primary key. Expired rows are treated as absent by every
//! statement and removed by [`StateStore::purge_expired`].

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::StoreError;
use crate::store::{Expiry, StateStore};

/// SQL predicate for a row that has not expired.
const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// `(keep_current, ttl_secs)` bind values for an [`Expiry`].
fn expiry_binds(expiry: Expiry) -> (bool, Option<f64>) {
    match expiry {
        Expiry::Never => (false, None),
        Expiry::After(ttl) => (false, Some(ttl.as_secs_f64())),
        Expiry::Keep => (true, None),
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let query = format!("SELECT value FROM kv_entries WHERE key = $1 AND {LIVE}");
        let value = sqlx::query_scalar::<_, String>(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, expiry: Expiry) -> Result<(), StoreError> {
        let (keep, ttl_secs) = expiry_binds(expiry);
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) \
             VALUES ($1, $2, now() + $3::float8 * interval '1 second') \
             ON CONFLICT (key) DO UPDATE SET \
                value = EXCLUDED.value, \
                expires_at = CASE \
                    WHEN $4 AND (kv_entries.expires_at IS NULL OR kv_entries.expires_at > now()) \
                        THEN kv_entries.expires_at \
                    ELSE EXCLUDED.expires_at \
                END, \
                updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, expiry: Expiry) -> Result<bool, StoreError> {
        let (_, ttl_secs) = expiry_binds(expiry);
        // An expired row counts as absent, so the conflict arm only fires for
        // rows past their expiry.
        let won = sqlx::query_scalar::<_, String>(
            "INSERT INTO kv_entries (key, value, expires_at) \
             VALUES ($1, $2, now() + $3::float8 * interval '1 second') \
             ON CONFLICT (key) DO UPDATE SET \
                value = EXCLUDED.value, \
                expires_at = EXCLUDED.expires_at, \
                updated_at = now() \
             WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now() \
             RETURNING key",
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs)
        .fetch_optional(&self.pool)
        .await?;
        Ok(won.is_some())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        expiry: Expiry,
    ) -> Result<bool, StoreError> {
        let (keep, ttl_secs) = expiry_binds(expiry);
        let query = format!(
            "UPDATE kv_entries SET \
                value = $3, \
                expires_at = CASE WHEN $4 THEN expires_at \
                    ELSE now() + $5::float8 * interval '1 second' END, \
                updated_at = now() \
             WHERE key = $1 AND value = $2 AND {LIVE}"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(expected)
            .bind(new)
            .bind(keep)
            .bind(ttl_secs)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            "INSERT INTO kv_entries (key, value) VALUES ($1, $2::bigint::text) \
             ON CONFLICT (key) DO UPDATE SET \
                value = (CASE \
                    WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now() THEN 0 \
                    ELSE kv_entries.value::bigint \
                END + $2::bigint)::text, \
                expires_at = CASE \
                    WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now() THEN NULL \
                    ELSE kv_entries.expires_at \
                END, \
                updated_at = now() \
             RETURNING value::bigint",
        )
        .bind(key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let query = format!("DELETE FROM kv_entries WHERE key = $1 AND {LIVE}");
        let result = sqlx::query(&query).bind(key).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        // `left()` instead of LIKE: keys contain `_`, which LIKE treats as a wildcard.
        let query = format!(
            "SELECT key, value FROM kv_entries \
             WHERE left(key, char_length($1)) = $1 AND {LIVE} \
             ORDER BY key"
        );
        let rows = sqlx::query_as::<_, (String, String)>(&query)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        crate::health_check(&self.pool).await?;
        Ok(())
    }
}
