//! PostgreSQL implementation of the state store.

use crate::store::{BusinessConnectionRecord, Session, StateStore, StoreError};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::future::Future;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Attempts per operation before the error is surfaced to the caller.
const RETRY_ATTEMPTS: usize = 3;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// Backoff strategy for one operation: 10 ms, 100 ms, 1 s (jittered).
fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(10)
        .map(jitter)
        .take(RETRY_ATTEMPTS)
}

async fn with_retry<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    Retry::spawn(retry_strategy(), op)
        .await
        .map_err(StoreError::Database)
}

impl PgStore {
    /// Connect a pool. Fails fast; startup treats this as fatal.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Create tables if missing and seed default settings. Safe to run on every start.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS sessions (
                external_id TEXT PRIMARY KEY,
                first_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
                state JSONB NOT NULL DEFAULT '{}',
                last_update_id BIGINT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS style_messages (
                id BIGSERIAL PRIMARY KEY,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS bot_settings (
                key VARCHAR(50) PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS business_connections (
                connection_id VARCHAR(100) PRIMARY KEY,
                owner_id BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"INSERT INTO bot_settings (key, value)
               VALUES ('enabled', 'false')
               ON CONFLICT (key) DO NOTHING"#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Round-trip check used at startup.
    pub async fn health_check(&self) -> Result<String, StoreError> {
        let row: (String,) = sqlx::query_as("SELECT version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn session(&self, external_id: &str) -> Result<Option<Session>, StoreError> {
        with_retry(|| async {
            sqlx::query_as::<_, Session>(
                r#"SELECT external_id, first_seen, last_seen, state, last_update_id
                   FROM sessions WHERE external_id = $1"#,
            )
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
        })
        .await
    }

    async fn get_or_create_session(&self, external_id: &str) -> Result<Session, StoreError> {
        with_retry(|| async {
            sqlx::query_as::<_, Session>(
                r#"INSERT INTO sessions (external_id) VALUES ($1)
                   ON CONFLICT (external_id) DO UPDATE SET last_seen = now()
                   RETURNING external_id, first_seen, last_seen, state, last_update_id"#,
            )
            .bind(external_id)
            .fetch_one(&self.pool)
            .await
        })
        .await
    }

    async fn record_event(
        &self,
        external_id: &str,
        update_id: i64,
        state: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        // Single upsert, atomic per session row. The WHERE clause makes redelivered
        // updates a no-op (rows_affected == 0).
        let result = with_retry(|| async {
            sqlx::query(
                r#"INSERT INTO sessions (external_id, state, last_update_id)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (external_id) DO UPDATE
                   SET last_seen = now(), state = $2, last_update_id = $3
                   WHERE sessions.last_update_id IS NULL OR sessions.last_update_id < $3"#,
            )
            .bind(external_id)
            .bind(state)
            .bind(update_id)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_style_messages(&self, messages: &[String]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            for message in messages {
                sqlx::query("INSERT INTO style_messages (message) VALUES ($1)")
                    .bind(message)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn style_messages(&self) -> Result<Vec<String>, StoreError> {
        with_retry(|| async {
            sqlx::query_scalar::<_, String>("SELECT message FROM style_messages ORDER BY id")
                .fetch_all(&self.pool)
                .await
        })
        .await
    }

    async fn style_message_count(&self) -> Result<i64, StoreError> {
        with_retry(|| async {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM style_messages")
                .fetch_one(&self.pool)
                .await
        })
        .await
    }

    async fn clear_style_messages(&self) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query("DELETE FROM style_messages")
                .execute(&self.pool)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_retry(|| async {
            sqlx::query_scalar::<_, String>("SELECT value FROM bot_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query(
                r#"INSERT INTO bot_settings (key, value) VALUES ($1, $2)
                   ON CONFLICT (key) DO UPDATE SET value = $2"#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn business_connections(&self) -> Result<Vec<BusinessConnectionRecord>, StoreError> {
        with_retry(|| async {
            sqlx::query_as::<_, BusinessConnectionRecord>(
                "SELECT connection_id, owner_id FROM business_connections",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await
    }

    async fn save_business_connection(
        &self,
        connection_id: &str,
        owner_id: i64,
    ) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query(
                r#"INSERT INTO business_connections (connection_id, owner_id)
                   VALUES ($1, $2)
                   ON CONFLICT (connection_id) DO UPDATE SET owner_id = $2"#,
            )
            .bind(connection_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn delete_business_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query("DELETE FROM business_connections WHERE connection_id = $1")
                .bind(connection_id)
                .execute(&self.pool)
                .await
                .map(|_| ())
        })
        .await
    }
}
