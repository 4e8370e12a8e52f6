//! Durable state: sessions, style corpus, settings, and business connections.
//!
//! `StateStore` is the seam the dispatcher programs against; `PgStore` is the
//! PostgreSQL implementation. Sessions are keyed by the correspondent's external
//! identifier and carry a JSONB state blob plus the last applied Telegram
//! update id, which makes event recording idempotent under redelivery.

mod pg;

pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Setting key for the auto-reply toggle ("true" / "false").
pub const SETTING_ENABLED: &str = "enabled";

/// Minimum corpus size before auto-replies may be enabled.
pub const MIN_CORPUS_SIZE: i64 = 10;

/// One durable per-correspondent record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub external_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Conversation-state blob (e.g. the owner's pending-upload flag).
    pub state: serde_json::Value,
    /// Highest Telegram update id applied for this session (de-dup key).
    pub last_update_id: Option<i64>,
}

/// A Telegram Business connection the bot may answer through.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BusinessConnectionRecord {
    pub connection_id: String,
    pub owner_id: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Store contract. All operations are retried internally with bounded backoff;
/// a returned error means retries were exhausted and the caller should drop the
/// event rather than crash.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read-only session lookup. Used for dispatch gating so unhandled events
    /// leave no trace in the store.
    async fn session(&self, external_id: &str) -> Result<Option<Session>, StoreError>;

    /// Fetch the session for an external identifier, creating it on first contact.
    /// Touches `last_seen` on existing rows.
    async fn get_or_create_session(&self, external_id: &str) -> Result<Session, StoreError>;

    /// Transactionally record one applied event: touch `last_seen`, replace the
    /// state blob, advance `last_update_id`. Returns `false` without writing when
    /// `update_id` was already applied (transport redelivery).
    async fn record_event(
        &self,
        external_id: &str,
        update_id: i64,
        state: &serde_json::Value,
    ) -> Result<bool, StoreError>;

    async fn add_style_messages(&self, messages: &[String]) -> Result<(), StoreError>;
    async fn style_messages(&self) -> Result<Vec<String>, StoreError>;
    async fn style_message_count(&self) -> Result<i64, StoreError>;
    async fn clear_style_messages(&self) -> Result<(), StoreError>;

    async fn setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn business_connections(&self) -> Result<Vec<BusinessConnectionRecord>, StoreError>;
    async fn save_business_connection(
        &self,
        connection_id: &str,
        owner_id: i64,
    ) -> Result<(), StoreError>;
    async fn delete_business_connection(&self, connection_id: &str) -> Result<(), StoreError>;
}
