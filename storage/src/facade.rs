//! Single entry point over one backend.
//!
//! The facade owns the cross-cutting behaviour that must be identical on every
//! backend: best-effort embedding on ingest, per-call timeouts, reply-chain
//! traversal, profile timestamps and the settings default overlay.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use embedding::EmbeddingService;
use tracing::{debug, info, instrument, warn};

use crate::backend::StorageBackend;
use crate::config::{StorageConfig, Timeouts};
use crate::error::{OpContext, Result, StorageError};
use crate::models::{
    ChatSettings, Message, ResolvedChatSettings, ScoredMessage, SettingsPatch, UserProfile,
};
use crate::retention::{self, RetentionState};
use crate::session;
use crate::settings::SettingsStore;
use crate::timeout::bounded;

pub struct StorageFacade {
    backend: Arc<dyn StorageBackend>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    settings: SettingsStore,
    context_window: usize,
    long_term_memory_enabled: bool,
    timeouts: Timeouts,
}

impl StorageFacade {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        embedder: Option<Arc<dyn EmbeddingService>>,
        config: &StorageConfig,
    ) -> Self {
        let settings = SettingsStore::new(
            backend.clone(),
            Arc::new(config.settings_defaults.clone()),
            config.timeouts.io,
        );
        Self {
            backend,
            embedder,
            settings,
            context_window: config.context_window,
            long_term_memory_enabled: config.long_term_memory_enabled,
            timeouts: config.timeouts,
        }
    }

    /// Validates `config`, opens its backend and wraps it.
    pub async fn open(
        config: &StorageConfig,
        embedder: Option<Arc<dyn EmbeddingService>>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = session::open_backend(config).await?;
        Ok(Self::new(backend, embedder, config))
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn embedder(&self) -> Option<&Arc<dyn EmbeddingService>> {
        self.embedder.as_ref()
    }

    /// Long-term memory is on and an embedding service is configured.
    pub fn semantic_search_enabled(&self) -> bool {
        self.long_term_memory_enabled && self.embedder.is_some()
    }

    pub async fn health_check(&self) -> Result<()> {
        bounded(
            self.timeouts.io,
            OpContext::new("health_check"),
            self.backend.health_check(),
        )
        .await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    // ---- messages ----

    /// Persists the message. When semantic search is on and the message needs a
    /// vector, embeds it first; any embedding failure is logged and the message
    /// is stored without a vector for the backfill worker to pick up. A repeated
    /// delivery with unchanged text keeps the vector already stored.
    #[instrument(skip(self, message), fields(chat_id = message.chat_id, message_id = message.message_id))]
    pub async fn add_message(&self, message: &Message) -> Result<()> {
        if message.message_id <= 0 {
            return Err(StorageError::Validation(format!(
                "message_id must be positive, got {}",
                message.message_id
            )));
        }

        let mut message = message.clone();
        if message.needs_embedding() {
            message.embedding = match self.stored_vector(&message).await? {
                Some(vector) => Some(vector),
                None => self.try_embed(&message).await,
            };
        }

        bounded(
            self.timeouts.io,
            OpContext::message("add_message", message.chat_id, message.message_id),
            self.backend.upsert_message(&message),
        )
        .await?;
        debug!(has_vector = message.embedding.is_some(), "Message stored");
        Ok(())
    }

    /// Vector already stored for this message, if its embedded text is unchanged.
    async fn stored_vector(&self, message: &Message) -> Result<Option<Vec<f32>>> {
        if !self.backend.capabilities().vector_search {
            return Ok(None);
        }
        let stored = bounded(
            self.timeouts.io,
            OpContext::message("add_message", message.chat_id, message.message_id),
            self.backend.get_message(message.chat_id, message.message_id),
        )
        .await?;
        Ok(stored
            .filter(|s| s.embedding_text() == message.embedding_text())
            .and_then(|s| s.embedding))
    }

    async fn try_embed(&self, message: &Message) -> Option<Vec<f32>> {
        let embedder = match &self.embedder {
            Some(embedder) if self.long_term_memory_enabled => embedder,
            _ => return None,
        };
        let caps = self.backend.capabilities();
        if !caps.vector_search {
            return None;
        }

        let context = OpContext::message("embed_message", message.chat_id, message.message_id);
        let result = bounded(self.timeouts.embed, context, async {
            embedder
                .embed(&message.embedding_text())
                .await
                .map_err(StorageError::from)
        })
        .await;

        match result {
            Ok(vector) => match caps.embedding_dim {
                Some(expected) if vector.len() != expected => {
                    warn!(
                        expected,
                        actual = vector.len(),
                        "Embedding dimension mismatch; storing message without vector"
                    );
                    None
                }
                _ => Some(vector),
            },
            Err(e) => {
                warn!(error = %e, "Embedding failed; message deferred to backfill");
                None
            }
        }
    }

    pub async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Message>> {
        bounded(
            self.timeouts.io,
            OpContext::message("get_message", chat_id, message_id),
            self.backend.get_message(chat_id, message_id),
        )
        .await
    }

    /// Up to `limit` newest messages, oldest first.
    pub async fn get_recent(&self, chat_id: i64, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        bounded(
            self.timeouts.io,
            OpContext::chat("get_recent", chat_id),
            self.backend.recent_messages(chat_id, limit),
        )
        .await
    }

    /// Recent window sized by the configured context window.
    pub async fn recent_context(&self, chat_id: i64) -> Result<Vec<Message>> {
        self.get_recent(chat_id, self.context_window).await
    }

    pub async fn get_since(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        bounded(
            self.timeouts.io,
            OpContext::chat("get_since", chat_id),
            self.backend.messages_since(chat_id, user_id, since, limit),
        )
        .await
    }

    /// Follows reply links upward from `start_message_id`, returning at most
    /// `max_depth` messages root-most first. A missing link ends the walk.
    #[instrument(skip(self))]
    pub async fn get_reply_chain(
        &self,
        chat_id: i64,
        start_message_id: i64,
        max_depth: usize,
    ) -> Result<Vec<Message>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = start_message_id;

        while chain.len() < max_depth && next != 0 && seen.insert(next) {
            match self.get_message(chat_id, next).await? {
                Some(message) => {
                    next = message.reply_to_message_id;
                    chain.push(message);
                }
                None => {
                    debug!(chat_id, missing = next, "Reply chain truncated at missing message");
                    break;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Semantic search inside one chat, best first.
    ///
    /// Returns an empty list without calling the provider when the query is
    /// blank or semantic search is off. Fails with `Unsupported` when the
    /// backend stores no vectors.
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    pub async fn search_relevant(
        &self,
        chat_id: i64,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredMessage>> {
        let embedder = match &self.embedder {
            Some(embedder) if self.long_term_memory_enabled => embedder,
            _ => return Ok(Vec::new()),
        };
        let query = query.trim();
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if !self.backend.capabilities().vector_search {
            return Err(StorageError::unsupported(self.backend.name(), "search_relevant"));
        }

        let vector = bounded(self.timeouts.embed, OpContext::chat("embed_query", chat_id), async {
            embedder.embed(query).await.map_err(StorageError::from)
        })
        .await?;

        let results = bounded(
            self.timeouts.search,
            OpContext::chat("search_similar", chat_id),
            self.backend.search_similar(chat_id, &vector, k),
        )
        .await?;
        debug!(chat_id, results = results.len(), "Semantic search finished");
        Ok(results)
    }

    /// [`search_relevant`](Self::search_relevant) for conversation flows: an
    /// unsupported backend or provider failure reads as "nothing relevant".
    pub async fn relevant_history(&self, chat_id: i64, query: &str, k: usize) -> Result<Vec<Message>> {
        match self.search_relevant(chat_id, query, k).await {
            Ok(results) => Ok(results.into_iter().map(|r| r.message).collect()),
            Err(e) if e.is_unsupported() => {
                debug!(chat_id, backend = self.backend.name(), "Semantic search unsupported");
                Ok(Vec::new())
            }
            Err(StorageError::Provider(e)) => {
                warn!(chat_id, error = %e, "Query embedding failed; no relevant history");
                Ok(Vec::new())
            }
            Err(StorageError::Timeout { context, after }) if context.operation == "embed_query" => {
                warn!(chat_id, ?after, "Query embedding timed out; no relevant history");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes every message of the chat. Profiles and settings are kept.
    #[instrument(skip(self))]
    pub async fn clear_chat(&self, chat_id: i64) -> Result<u64> {
        let deleted = bounded(
            self.timeouts.io,
            OpContext::chat("clear_chat", chat_id),
            self.backend.delete_chat_messages(chat_id),
        )
        .await?;
        info!(chat_id, deleted, "Chat history cleared");
        Ok(deleted)
    }

    pub async fn list_chat_ids(&self) -> Result<Vec<i64>> {
        bounded(
            self.timeouts.io,
            OpContext::new("list_chat_ids"),
            self.backend.list_chat_ids(),
        )
        .await
    }

    pub async fn chat_state(&self, chat_id: i64) -> Result<RetentionState> {
        retention::measure(self.backend.as_ref(), chat_id, self.timeouts.io).await
    }

    // ---- profiles ----

    pub async fn get_profile(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
        bounded(
            self.timeouts.io,
            OpContext::chat("get_profile", chat_id),
            self.backend.get_profile(chat_id, user_id),
        )
        .await
    }

    /// Most recently seen first.
    pub async fn list_profiles(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        bounded(
            self.timeouts.io,
            OpContext::chat("list_profiles", chat_id),
            self.backend.list_profiles(chat_id),
        )
        .await
    }

    /// Stores the complete profile. `created_at` of an existing record is kept
    /// and `updated_at` always moves forward.
    #[instrument(skip(self, profile), fields(chat_id = profile.chat_id, user_id = profile.user_id))]
    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        let existing = self.get_profile(profile.chat_id, profile.user_id).await?;
        let mut profile = profile.clone();
        let now = Utc::now();
        profile.updated_at = match &existing {
            Some(prev) => {
                profile.created_at = prev.created_at;
                now.max(prev.updated_at + ChronoDuration::milliseconds(1))
            }
            None => now,
        };

        bounded(
            self.timeouts.io,
            OpContext::chat("upsert_profile", profile.chat_id),
            self.backend.upsert_profile(&profile),
        )
        .await?;
        Ok(profile)
    }

    /// Records that `user_id` was active in the chat, creating the profile on
    /// first sight. A non-empty `username` replaces the stored one.
    pub async fn record_activity(
        &self,
        chat_id: i64,
        user_id: i64,
        username: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<UserProfile> {
        let mut profile = self
            .get_profile(chat_id, user_id)
            .await?
            .unwrap_or_else(|| UserProfile::new(chat_id, user_id));
        if !username.is_empty() {
            profile.username = username.to_string();
        }
        profile.last_seen = Some(profile.last_seen.map_or(seen_at, |prev| prev.max(seen_at)));
        self.upsert_profile(&profile).await
    }

    // ---- settings ----

    pub async fn get_settings(&self, chat_id: i64) -> Result<ResolvedChatSettings> {
        self.settings.get(chat_id).await
    }

    pub async fn patch_settings(
        &self,
        chat_id: i64,
        patch: SettingsPatch,
    ) -> Result<ResolvedChatSettings> {
        self.settings.patch(chat_id, patch).await
    }

    pub async fn upsert_settings(&self, record: &ChatSettings) -> Result<()> {
        self.settings.upsert(record).await
    }
}
