//! Per-chat settings with default-overlay resolution.
//!
//! Reading a chat whose stored record is missing or incomplete materializes
//! the defaults into storage before returning, so the persisted state is
//! observable as soon as `get` returns. Concurrent first readers converge on
//! one record through the backend's atomic fill-if-unset write.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::backend::StorageBackend;
use crate::error::{OpContext, Result};
use crate::models::{ChatSettings, ResolvedChatSettings, SettingsDefaults, SettingsPatch};
use crate::timeout::bounded;

#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn StorageBackend>,
    defaults: Arc<SettingsDefaults>,
    io_timeout: Duration,
}

impl SettingsStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        defaults: Arc<SettingsDefaults>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            defaults,
            io_timeout,
        }
    }

    pub fn defaults(&self) -> &SettingsDefaults {
        &self.defaults
    }

    /// Fully resolved settings for the chat. Never yields an unset field.
    #[instrument(skip(self))]
    pub async fn get(&self, chat_id: i64) -> Result<ResolvedChatSettings> {
        let stored = self.get_stored(chat_id).await?;
        let record = match stored {
            Some(record) if record.is_complete() => record,
            stored => {
                let missing = stored
                    .as_ref()
                    .map(|r| r.missing_fields().len())
                    .unwrap_or(0);
                debug!(chat_id, existed = stored.is_some(), missing, "Materializing settings defaults");
                self.materialize(chat_id).await?
            }
        };
        Ok(record.resolve(&self.defaults))
    }

    /// The stored record as-is, without defaults.
    pub async fn get_stored(&self, chat_id: i64) -> Result<Option<ChatSettings>> {
        bounded(
            self.io_timeout,
            OpContext::chat("get_settings", chat_id),
            self.backend.get_settings(chat_id),
        )
        .await
    }

    async fn materialize(&self, chat_id: i64) -> Result<ChatSettings> {
        let defaults = ChatSettings::from_defaults(chat_id, &self.defaults);
        bounded(
            self.io_timeout,
            OpContext::chat("materialize_settings", chat_id),
            self.backend.materialize_settings(&defaults),
        )
        .await
    }

    /// Single-field update; creates the record when the chat has none.
    #[instrument(skip(self))]
    pub async fn patch(&self, chat_id: i64, patch: SettingsPatch) -> Result<ResolvedChatSettings> {
        patch.validate()?;
        let record = bounded(
            self.io_timeout,
            OpContext::chat("patch_settings", chat_id),
            self.backend.patch_settings(chat_id, &patch),
        )
        .await?;
        info!(chat_id, field = %patch.field(), "Chat setting updated");
        Ok(record.resolve(&self.defaults))
    }

    /// Parses `field`/`value` text and applies it as a patch.
    pub async fn set(&self, chat_id: i64, field: &str, value: &str) -> Result<ResolvedChatSettings> {
        let patch = SettingsPatch::parse(field, value)?;
        self.patch(chat_id, patch).await
    }

    /// Whole-record replace; fields left `None` fall back to defaults on read.
    pub async fn upsert(&self, record: &ChatSettings) -> Result<()> {
        record.validate()?;
        bounded(
            self.io_timeout,
            OpContext::chat("upsert_settings", record.chat_id),
            self.backend.upsert_settings(record),
        )
        .await
    }
}
