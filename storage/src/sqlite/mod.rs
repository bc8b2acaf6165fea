//! Relational backend over SQLite (sqlx).
//!
//! Stores messages, profiles and settings; does not store vectors, so the
//! vector operations keep the trait's `Unsupported` defaults.

mod messages;
mod pool;
mod profiles;
mod settings;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::backend::{BackendCapabilities, StorageBackend};
use crate::error::{OpContext, Result, StorageError};
use crate::models::{ChatSettings, Message, SettingsPatch, UserProfile};

pub use pool::SqlitePoolManager;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
    chat_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL DEFAULT 0,
    is_bot INTEGER NOT NULL DEFAULT 0,
    timestamp_ms INTEGER NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    caption TEXT NOT NULL DEFAULT '',
    reply_to_message_id INTEGER NOT NULL DEFAULT 0,
    has_media INTEGER NOT NULL DEFAULT 0,
    is_voice INTEGER NOT NULL DEFAULT 0,
    is_forward INTEGER NOT NULL DEFAULT 0,
    forward_from_user_id INTEGER NOT NULL DEFAULT 0,
    forward_from_chat_id INTEGER NOT NULL DEFAULT 0,
    forward_from_message_id INTEGER NOT NULL DEFAULT 0,
    forwarded_at_ms INTEGER,
    PRIMARY KEY (chat_id, message_id)
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_chat_time ON chat_messages(chat_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_chat_messages_user ON chat_messages(chat_id, user_id);

CREATE TABLE IF NOT EXISTS user_profiles (
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    username TEXT NOT NULL DEFAULT '',
    display_alias TEXT NOT NULL DEFAULT '',
    gender_or_tag TEXT NOT NULL DEFAULT '',
    real_name TEXT NOT NULL DEFAULT '',
    freeform_bio TEXT NOT NULL DEFAULT '',
    auto_bio TEXT NOT NULL DEFAULT '',
    last_auto_bio_update TEXT,
    last_seen TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (chat_id, user_id)
);

CREATE TABLE IF NOT EXISTS chat_settings (
    chat_id INTEGER PRIMARY KEY,
    conversation_style TEXT,
    temperature REAL,
    model TEXT,
    safety_threshold TEXT,
    voice_transcription_enabled INTEGER,
    direct_reply_limit_enabled INTEGER,
    direct_reply_limit_count INTEGER,
    direct_reply_limit_window_secs INTEGER,
    srach_analysis_enabled INTEGER,
    updated_at TEXT
);
"#;

pub(crate) fn db_err(context: OpContext) -> impl FnOnce(sqlx::Error) -> StorageError {
    move |e| StorageError::database(context, e)
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// SQLite-backed [`StorageBackend`]. Cloning shares the pool.
#[derive(Clone)]
pub struct SqliteBackend {
    pool_manager: SqlitePoolManager,
}

impl SqliteBackend {
    /// Opens (creating if needed) the database and provisions the schema.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool_manager = SqlitePoolManager::new(database_url)
            .await
            .map_err(db_err(OpContext::new("open")))?;
        let backend = Self { pool_manager };
        backend.init().await?;
        Ok(backend)
    }

    async fn init(&self) -> Result<()> {
        info!("Creating database tables if not exist");
        sqlx::raw_sql(SCHEMA)
            .execute(self.pool_manager.pool())
            .await
            .map_err(db_err(OpContext::new("init_schema")))?;
        info!("Database tables created successfully");
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.pool_manager.pool()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map_err(db_err(OpContext::new("health_check")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing SQLite pool");
        self.pool_manager.close().await;
        Ok(())
    }

    async fn upsert_message(&self, message: &Message) -> Result<()> {
        messages::upsert(self.pool(), message).await
    }

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Message>> {
        messages::get(self.pool(), chat_id, message_id).await
    }

    async fn recent_messages(&self, chat_id: i64, limit: usize) -> Result<Vec<Message>> {
        messages::recent(self.pool(), chat_id, limit).await
    }

    async fn messages_since(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        messages::since(self.pool(), chat_id, user_id, since, limit).await
    }

    async fn delete_chat_messages(&self, chat_id: i64) -> Result<u64> {
        messages::delete_chat(self.pool(), chat_id).await
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>> {
        messages::chat_ids(self.pool()).await
    }

    async fn chat_storage_bytes(&self, chat_id: i64) -> Result<u64> {
        messages::storage_bytes(self.pool(), chat_id).await
    }

    async fn oldest_message_time(&self, chat_id: i64) -> Result<Option<DateTime<Utc>>> {
        messages::oldest_time(self.pool(), chat_id).await
    }

    async fn delete_messages_before(&self, chat_id: i64, before: DateTime<Utc>) -> Result<u64> {
        messages::delete_before(self.pool(), chat_id, before).await
    }

    async fn get_profile(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
        profiles::get(self.pool(), chat_id, user_id).await
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        profiles::upsert(self.pool(), profile).await
    }

    async fn list_profiles(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        profiles::list(self.pool(), chat_id).await
    }

    async fn get_settings(&self, chat_id: i64) -> Result<Option<ChatSettings>> {
        settings::get(self.pool(), chat_id).await
    }

    async fn upsert_settings(&self, record: &ChatSettings) -> Result<()> {
        settings::upsert(self.pool(), record).await
    }

    async fn patch_settings(&self, chat_id: i64, patch: &SettingsPatch) -> Result<ChatSettings> {
        settings::patch(self.pool(), chat_id, patch).await
    }

    async fn materialize_settings(&self, defaults: &ChatSettings) -> Result<ChatSettings> {
        settings::materialize(self.pool(), defaults).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteBackend) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let backend = SqliteBackend::new(path.to_str().unwrap()).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_vector_ops_unsupported() {
        let (_dir, backend) = open().await;
        assert!(!backend.capabilities().vector_search);
        let err = backend.search_similar(1, &[0.1, 0.2], 3).await.unwrap_err();
        assert!(err.is_unsupported());
        let err = backend.set_embedding(1, 1, &[0.1]).await.unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_storage_bytes_counts_utf8_bytes() {
        let (_dir, backend) = open().await;
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        backend
            .upsert_message(&Message::new(1, 1, 2, t, "héllo").with_caption("ok"))
            .await
            .unwrap();
        let bytes = backend.chat_storage_bytes(1).await.unwrap();
        assert_eq!(bytes, 64 + "héllo".len() as u64 + 2);
        assert_eq!(backend.chat_storage_bytes(999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_url() {
        let backend = SqliteBackend::new("sqlite::memory:").await.unwrap();
        backend.health_check().await.unwrap();
        assert!(backend.list_chat_ids().await.unwrap().is_empty());
    }
}
