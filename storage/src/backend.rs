//! Backend contract: one trait implemented by every physical store.
//!
//! Vector operations have default implementations that report
//! [`StorageError::Unsupported`], so a backend without vector storage only
//! overrides what it can actually do and callers can tell "no results" from
//! "not implemented here".

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StorageError};
use crate::models::{ChatSettings, Message, MessageKey, ScoredMessage, SettingsPatch, UserProfile};

/// What the backend can do beyond plain CRUD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    pub vector_search: bool,
    /// Fixed vector length the backend stores, when it enforces one.
    pub embedding_dim: Option<usize>,
}

/// Connected handle to one physical store.
///
/// Implementations must be safe to share across tasks; concurrency control
/// for unrelated chats is pushed to the store (upsert-on-conflict) or to
/// per-chat locks, never a global one.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and `Unsupported` errors.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Cheap round-trip proving the store is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Flushes and releases resources. Further calls may fail.
    async fn close(&self) -> Result<()>;

    // ---- messages ----

    /// Inserts or replaces the message identified by `(chat_id, message_id)`.
    async fn upsert_message(&self, message: &Message) -> Result<()>;

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Message>>;

    /// Up to `limit` newest messages, returned oldest first.
    async fn recent_messages(&self, chat_id: i64, limit: usize) -> Result<Vec<Message>>;

    /// Messages with `timestamp >= since`, optionally by one author. When more
    /// than `limit` match, the newest `limit` are kept. Oldest first.
    async fn messages_since(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Removes every message of the chat; returns how many were deleted.
    async fn delete_chat_messages(&self, chat_id: i64) -> Result<u64>;

    /// Chats that have at least one stored message, ascending.
    async fn list_chat_ids(&self) -> Result<Vec<i64>>;

    // ---- vectors ----

    /// Nearest neighbours of `query` inside one chat, best first.
    async fn search_similar(
        &self,
        _chat_id: i64,
        _query: &[f32],
        _k: usize,
    ) -> Result<Vec<ScoredMessage>> {
        Err(StorageError::unsupported(self.name(), "search_similar"))
    }

    /// Up to `limit` embeddable messages without a vector, oldest first,
    /// excluding `skip`.
    async fn find_unembedded(
        &self,
        _limit: usize,
        _skip: &HashSet<MessageKey>,
    ) -> Result<Vec<Message>> {
        Err(StorageError::unsupported(self.name(), "find_unembedded"))
    }

    /// Attaches a vector to an existing message without touching other fields.
    /// Returns `false` when the message no longer exists; it is never recreated.
    async fn set_embedding(&self, _chat_id: i64, _message_id: i64, _vector: &[f32]) -> Result<bool> {
        Err(StorageError::unsupported(self.name(), "set_embedding"))
    }

    // ---- retention ----

    /// Footprint estimate in bytes (see [`Message::approx_size`]).
    async fn chat_storage_bytes(&self, chat_id: i64) -> Result<u64>;

    async fn oldest_message_time(&self, chat_id: i64) -> Result<Option<DateTime<Utc>>>;

    /// Deletes messages with `timestamp < before`; returns how many were deleted.
    async fn delete_messages_before(&self, chat_id: i64, before: DateTime<Utc>) -> Result<u64>;

    // ---- profiles ----

    async fn get_profile(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>>;

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()>;

    async fn list_profiles(&self, chat_id: i64) -> Result<Vec<UserProfile>>;

    // ---- settings ----

    async fn get_settings(&self, chat_id: i64) -> Result<Option<ChatSettings>>;

    /// Whole-record replace.
    async fn upsert_settings(&self, settings: &ChatSettings) -> Result<()>;

    /// Single-field update; creates the record when absent. Returns the stored record.
    async fn patch_settings(&self, chat_id: i64, patch: &SettingsPatch) -> Result<ChatSettings>;

    /// Creates the record from `defaults` when absent, otherwise fills only
    /// its unset fields from `defaults`. Atomic with respect to concurrent
    /// callers; returns the canonical stored record.
    async fn materialize_settings(&self, defaults: &ChatSettings) -> Result<ChatSettings>;
}
