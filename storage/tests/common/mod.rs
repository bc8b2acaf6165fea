//! Shared helpers for chat-storage integration tests.
//!
//! Provides a deterministic embedding service, a fault-injecting backend
//! wrapper, backend constructors and message builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use embedding::{ensure_non_empty, EmbeddingError, EmbeddingService};
use tempfile::TempDir;

use chat_storage::{
    BackendCapabilities, ChatSettings, FileBackend, Message, MessageKey, OpContext, Result,
    ScoredMessage, SettingsPatch, SqliteBackend, StorageBackend, StorageConfig, StorageError,
    StorageFacade, UserProfile,
};

pub const DIM: usize = 64;

/// Bag-of-words embedding: each distinct lowercase word gets its own
/// component (in first-seen order, wrapping at `dim`), so texts sharing words
/// score higher. Counts calls and fails on chosen texts.
pub struct HashEmbedding {
    dim: usize,
    calls: AtomicUsize,
    failing: HashSet<String>,
    vocabulary: Mutex<HashMap<String, usize>>,
}

impl HashEmbedding {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
            failing: HashSet::new(),
            vocabulary: Mutex::new(HashMap::new()),
        }
    }

    /// Texts for which `embed` always returns a provider error.
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vocabulary = self.vocabulary.lock().unwrap();
        let mut vector = vec![0.0; self.dim];
        for word in text.split_whitespace() {
            let next = vocabulary.len();
            let slot = *vocabulary.entry(word.to_lowercase()).or_insert(next);
            vector[slot % self.dim] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedding {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ensure_non_empty(text)?;
        if self.failing.contains(text) {
            return Err(EmbeddingError::Provider(format!("refused: {}", text)));
        }
        Ok(self.vector_for(text))
    }
}

/// Delegates to `inner`, except that retention and vector writes for the
/// chats in `failing_chats` fail with a database error.
pub struct FlakyBackend {
    inner: Arc<dyn StorageBackend>,
    failing_chats: HashSet<i64>,
}

impl FlakyBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, failing_chats: impl IntoIterator<Item = i64>) -> Self {
        Self {
            inner,
            failing_chats: failing_chats.into_iter().collect(),
        }
    }

    fn check(&self, operation: &'static str, chat_id: i64) -> Result<()> {
        if self.failing_chats.contains(&chat_id) {
            return Err(StorageError::database(
                OpContext::chat(operation, chat_id),
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn upsert_message(&self, message: &Message) -> Result<()> {
        self.inner.upsert_message(message).await
    }

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Message>> {
        self.inner.get_message(chat_id, message_id).await
    }

    async fn recent_messages(&self, chat_id: i64, limit: usize) -> Result<Vec<Message>> {
        self.inner.recent_messages(chat_id, limit).await
    }

    async fn messages_since(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.inner.messages_since(chat_id, user_id, since, limit).await
    }

    async fn delete_chat_messages(&self, chat_id: i64) -> Result<u64> {
        self.inner.delete_chat_messages(chat_id).await
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>> {
        self.inner.list_chat_ids().await
    }

    async fn search_similar(&self, chat_id: i64, query: &[f32], k: usize) -> Result<Vec<ScoredMessage>> {
        self.inner.search_similar(chat_id, query, k).await
    }

    async fn find_unembedded(&self, limit: usize, skip: &HashSet<MessageKey>) -> Result<Vec<Message>> {
        self.inner.find_unembedded(limit, skip).await
    }

    async fn set_embedding(&self, chat_id: i64, message_id: i64, vector: &[f32]) -> Result<bool> {
        self.check("set_embedding", chat_id)?;
        self.inner.set_embedding(chat_id, message_id, vector).await
    }

    async fn chat_storage_bytes(&self, chat_id: i64) -> Result<u64> {
        self.check("chat_storage_bytes", chat_id)?;
        self.inner.chat_storage_bytes(chat_id).await
    }

    async fn oldest_message_time(&self, chat_id: i64) -> Result<Option<DateTime<Utc>>> {
        self.check("oldest_message_time", chat_id)?;
        self.inner.oldest_message_time(chat_id).await
    }

    async fn delete_messages_before(&self, chat_id: i64, before: DateTime<Utc>) -> Result<u64> {
        self.check("delete_messages_before", chat_id)?;
        self.inner.delete_messages_before(chat_id, before).await
    }

    async fn get_profile(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
        self.inner.get_profile(chat_id, user_id).await
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        self.inner.upsert_profile(profile).await
    }

    async fn list_profiles(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        self.inner.list_profiles(chat_id).await
    }

    async fn get_settings(&self, chat_id: i64) -> Result<Option<ChatSettings>> {
        self.inner.get_settings(chat_id).await
    }

    async fn upsert_settings(&self, settings: &ChatSettings) -> Result<()> {
        self.inner.upsert_settings(settings).await
    }

    async fn patch_settings(&self, chat_id: i64, patch: &SettingsPatch) -> Result<ChatSettings> {
        self.inner.patch_settings(chat_id, patch).await
    }

    async fn materialize_settings(&self, defaults: &ChatSettings) -> Result<ChatSettings> {
        self.inner.materialize_settings(defaults).await
    }
}

/// 2024-01-01T00:00:00Z.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at_hours(hours: i64) -> DateTime<Utc> {
    t0() + Duration::hours(hours)
}

pub fn at_minutes(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

/// Plain text message from user 100 at `t0 + minutes`.
pub fn msg(chat_id: i64, message_id: i64, minutes: i64, text: &str) -> Message {
    Message::new(chat_id, message_id, 100, at_minutes(minutes), text)
}

pub async fn sqlite_backend() -> (TempDir, Arc<dyn StorageBackend>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("chat_memory.db");
    let backend = SqliteBackend::new(&path.to_string_lossy())
        .await
        .expect("Failed to open SQLite backend");
    (dir, Arc::new(backend))
}

pub async fn file_backend() -> (TempDir, Arc<dyn StorageBackend>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let backend = FileBackend::open(dir.path())
        .await
        .expect("Failed to open file backend");
    (dir, Arc::new(backend))
}

pub fn memory_config() -> StorageConfig {
    StorageConfig {
        long_term_memory_enabled: true,
        context_window: 3,
        ..Default::default()
    }
}

pub fn facade(
    backend: Arc<dyn StorageBackend>,
    embedder: Option<Arc<HashEmbedding>>,
    config: &StorageConfig,
) -> StorageFacade {
    let embedder = embedder.map(|e| e as Arc<dyn EmbeddingService>);
    StorageFacade::new(backend, embedder, config)
}

pub fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|m| m.message_id).collect()
}
