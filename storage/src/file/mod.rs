//! Local file cache backend.
//!
//! Layout under the data directory:
//!
//! ```text
//! messages/<chat_id>.json   one partition per chat
//! profiles.json
//! settings.json
//! ```
//!
//! Everything is loaded into memory at open. The chat map is guarded by a
//! `RwLock` and every partition has its own `RwLock`, so writers to different
//! chats do not contend. Each mutation rewrites the affected file through a
//! temp file and rename while the partition lock is held.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::{BackendCapabilities, StorageBackend};
use crate::error::{OpContext, Result, StorageError};
use crate::models::{
    cosine_similarity, rank_by_similarity, sort_by_recency, sort_chronologically, ChatSettings,
    Message, MessageKey, ScoredMessage, SettingsPatch, UserProfile,
};

type Partition = Arc<RwLock<BTreeMap<i64, Message>>>;

/// File-backed [`StorageBackend`] with brute-force vector search.
pub struct FileBackend {
    root: PathBuf,
    chats: RwLock<HashMap<i64, Partition>>,
    profiles: RwLock<BTreeMap<(i64, i64), UserProfile>>,
    settings: RwLock<BTreeMap<i64, ChatSettings>>,
}

impl FileBackend {
    /// Opens the store at `root`, creating the directory layout when missing.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let context = OpContext::new("open");
        let messages_dir = root.join("messages");
        tokio::fs::create_dir_all(&messages_dir)
            .await
            .map_err(|e| StorageError::io(context, e))?;

        let mut chats = HashMap::new();
        let mut entries = tokio::fs::read_dir(&messages_dir)
            .await
            .map_err(|e| StorageError::io(context, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(context, e))?
        {
            let path = entry.path();
            let Some(chat_id) = chat_id_from_path(&path) else {
                debug!(path = %path.display(), "Skipping non-partition file");
                continue;
            };
            let messages: Vec<Message> = read_json(&path, context).await?.unwrap_or_default();
            let partition: BTreeMap<i64, Message> =
                messages.into_iter().map(|m| (m.message_id, m)).collect();
            chats.insert(chat_id, Arc::new(RwLock::new(partition)));
        }

        let profiles: Vec<UserProfile> = read_json(&root.join("profiles.json"), context)
            .await?
            .unwrap_or_default();
        let settings: Vec<ChatSettings> = read_json(&root.join("settings.json"), context)
            .await?
            .unwrap_or_default();

        info!(
            root = %root.display(),
            chats = chats.len(),
            profiles = profiles.len(),
            settings = settings.len(),
            "File store loaded"
        );

        Ok(Self {
            root,
            chats: RwLock::new(chats),
            profiles: RwLock::new(
                profiles
                    .into_iter()
                    .map(|p| ((p.chat_id, p.user_id), p))
                    .collect(),
            ),
            settings: RwLock::new(settings.into_iter().map(|s| (s.chat_id, s)).collect()),
        })
    }

    fn partition_path(&self, chat_id: i64) -> PathBuf {
        self.root.join("messages").join(format!("{}.json", chat_id))
    }

    async fn partition(&self, chat_id: i64) -> Option<Partition> {
        self.chats.read().await.get(&chat_id).cloned()
    }

    async fn partition_or_create(&self, chat_id: i64) -> Partition {
        if let Some(p) = self.partition(chat_id).await {
            return p;
        }
        let mut chats = self.chats.write().await;
        chats.entry(chat_id).or_default().clone()
    }

    async fn all_partitions(&self) -> Vec<(i64, Partition)> {
        let chats = self.chats.read().await;
        let mut all: Vec<(i64, Partition)> = chats.iter().map(|(id, p)| (*id, p.clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    async fn flush_partition(
        &self,
        chat_id: i64,
        partition: &BTreeMap<i64, Message>,
        context: OpContext,
    ) -> Result<()> {
        let messages: Vec<&Message> = partition.values().collect();
        write_json_atomic(&self.partition_path(chat_id), &messages, context).await
    }

    async fn flush_profiles(
        &self,
        profiles: &BTreeMap<(i64, i64), UserProfile>,
        context: OpContext,
    ) -> Result<()> {
        let all: Vec<&UserProfile> = profiles.values().collect();
        write_json_atomic(&self.root.join("profiles.json"), &all, context).await
    }

    async fn flush_settings(
        &self,
        settings: &BTreeMap<i64, ChatSettings>,
        context: OpContext,
    ) -> Result<()> {
        let all: Vec<&ChatSettings> = settings.values().collect();
        write_json_atomic(&self.root.join("settings.json"), &all, context).await
    }

    /// Applies `f` to the chat's partition under its write lock and persists
    /// the result when `f` reports a change.
    async fn mutate_partition<T>(
        &self,
        chat_id: i64,
        context: OpContext,
        f: impl FnOnce(&mut BTreeMap<i64, Message>) -> (bool, T),
    ) -> Result<T> {
        let Some(partition) = self.partition(chat_id).await else {
            let mut empty = BTreeMap::new();
            return Ok(f(&mut empty).1);
        };
        let mut guard = partition.write().await;
        let (changed, out) = f(&mut guard);
        if changed {
            self.flush_partition(chat_id, &guard, context).await?;
        }
        Ok(out)
    }
}

fn chat_id_from_path(path: &Path) -> Option<i64> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

async fn read_json<T: DeserializeOwned>(path: &Path, context: OpContext) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::serialization(context, format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(context, e)),
    }
}

async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    context: OpContext,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StorageError::serialization(context, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| StorageError::io(context, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(context, e))?;
    Ok(())
}

fn latest_chronological(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
    sort_chronologically(&mut messages);
    let skip = messages.len().saturating_sub(limit);
    messages.split_off(skip)
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            vector_search: true,
            embedding_dim: None,
        }
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::metadata(self.root.join("messages"))
            .await
            .map_err(|e| StorageError::io(OpContext::new("health_check"), e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!(root = %self.root.display(), "File store closed");
        Ok(())
    }

    async fn upsert_message(&self, message: &Message) -> Result<()> {
        let context = OpContext::message("upsert_message", message.chat_id, message.message_id);
        let partition = self.partition_or_create(message.chat_id).await;
        let mut guard = partition.write().await;
        guard.insert(message.message_id, message.clone());
        self.flush_partition(message.chat_id, &guard, context).await
    }

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Message>> {
        let Some(partition) = self.partition(chat_id).await else {
            return Ok(None);
        };
        let guard = partition.read().await;
        Ok(guard.get(&message_id).cloned())
    }

    async fn recent_messages(&self, chat_id: i64, limit: usize) -> Result<Vec<Message>> {
        let Some(partition) = self.partition(chat_id).await else {
            return Ok(Vec::new());
        };
        let all: Vec<Message> = partition.read().await.values().cloned().collect();
        Ok(latest_chronological(all, limit))
    }

    async fn messages_since(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let Some(partition) = self.partition(chat_id).await else {
            return Ok(Vec::new());
        };
        let matching: Vec<Message> = partition
            .read()
            .await
            .values()
            .filter(|m| m.timestamp >= since)
            .filter(|m| user_id.map_or(true, |uid| m.user_id == uid))
            .cloned()
            .collect();
        Ok(latest_chronological(matching, limit))
    }

    async fn delete_chat_messages(&self, chat_id: i64) -> Result<u64> {
        let context = OpContext::chat("delete_chat_messages", chat_id);
        let removed = self.chats.write().await.remove(&chat_id);
        let Some(partition) = removed else {
            return Ok(0);
        };
        let guard = partition.write().await;
        match tokio::fs::remove_file(self.partition_path(chat_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(context, e)),
        }
        Ok(guard.len() as u64)
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        for (chat_id, partition) in self.all_partitions().await {
            if !partition.read().await.is_empty() {
                ids.push(chat_id);
            }
        }
        Ok(ids)
    }

    async fn search_similar(&self, chat_id: i64, query: &[f32], k: usize) -> Result<Vec<ScoredMessage>> {
        let Some(partition) = self.partition(chat_id).await else {
            return Ok(Vec::new());
        };
        let mut results: Vec<ScoredMessage> = partition
            .read()
            .await
            .values()
            .filter_map(|m| {
                let vector = m.embedding.as_ref()?;
                (vector.len() == query.len()).then(|| ScoredMessage {
                    score: cosine_similarity(query, vector),
                    message: m.clone(),
                })
            })
            .collect();
        rank_by_similarity(&mut results);
        results.truncate(k);
        Ok(results)
    }

    async fn find_unembedded(&self, limit: usize, skip: &HashSet<MessageKey>) -> Result<Vec<Message>> {
        let mut candidates = Vec::new();
        for (_, partition) in self.all_partitions().await {
            let guard = partition.read().await;
            candidates.extend(
                guard
                    .values()
                    .filter(|m| m.needs_embedding() && !skip.contains(&m.key()))
                    .cloned(),
            );
        }
        candidates.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.key().cmp(&b.key()))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn set_embedding(&self, chat_id: i64, message_id: i64, vector: &[f32]) -> Result<bool> {
        let context = OpContext::message("set_embedding", chat_id, message_id);
        let found = self
            .mutate_partition(chat_id, context, |partition| match partition.get_mut(&message_id) {
                Some(m) => {
                    m.embedding = Some(vector.to_vec());
                    (true, true)
                }
                None => (false, false),
            })
            .await?;
        if !found {
            debug!(chat_id, message_id, "set_embedding: message no longer exists");
        }
        Ok(found)
    }

    async fn chat_storage_bytes(&self, chat_id: i64) -> Result<u64> {
        let Some(partition) = self.partition(chat_id).await else {
            return Ok(0);
        };
        let guard = partition.read().await;
        Ok(guard.values().map(Message::approx_size).sum())
    }

    async fn oldest_message_time(&self, chat_id: i64) -> Result<Option<DateTime<Utc>>> {
        let Some(partition) = self.partition(chat_id).await else {
            return Ok(None);
        };
        let guard = partition.read().await;
        Ok(guard.values().map(|m| m.timestamp).min())
    }

    async fn delete_messages_before(&self, chat_id: i64, before: DateTime<Utc>) -> Result<u64> {
        let context = OpContext::chat("delete_messages_before", chat_id);
        self.mutate_partition(chat_id, context, |partition| {
            let len = partition.len();
            partition.retain(|_, m| m.timestamp >= before);
            let deleted = (len - partition.len()) as u64;
            (deleted > 0, deleted)
        })
        .await
    }

    async fn get_profile(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().await.get(&(chat_id, user_id)).cloned())
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        let context = OpContext::chat("upsert_profile", profile.chat_id);
        let mut profiles = self.profiles.write().await;
        let mut record = profile.clone();
        if let Some(existing) = profiles.get(&(profile.chat_id, profile.user_id)) {
            record.created_at = existing.created_at;
        }
        profiles.insert((profile.chat_id, profile.user_id), record);
        self.flush_profiles(&profiles, context).await
    }

    async fn list_profiles(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        let profiles = self.profiles.read().await;
        let mut matching: Vec<UserProfile> = profiles
            .range((chat_id, i64::MIN)..=(chat_id, i64::MAX))
            .map(|(_, p)| p.clone())
            .collect();
        sort_by_recency(&mut matching);
        Ok(matching)
    }

    async fn get_settings(&self, chat_id: i64) -> Result<Option<ChatSettings>> {
        Ok(self.settings.read().await.get(&chat_id).cloned())
    }

    async fn upsert_settings(&self, record: &ChatSettings) -> Result<()> {
        let context = OpContext::chat("upsert_settings", record.chat_id);
        let mut settings = self.settings.write().await;
        let mut record = record.clone();
        record.updated_at = Some(Utc::now());
        settings.insert(record.chat_id, record);
        self.flush_settings(&settings, context).await
    }

    async fn patch_settings(&self, chat_id: i64, patch: &SettingsPatch) -> Result<ChatSettings> {
        let context = OpContext::chat("patch_settings", chat_id);
        let mut settings = self.settings.write().await;
        let record = settings
            .entry(chat_id)
            .or_insert_with(|| ChatSettings::empty(chat_id));
        patch.apply(record);
        record.updated_at = Some(Utc::now());
        let out = record.clone();
        self.flush_settings(&settings, context).await?;
        Ok(out)
    }

    async fn materialize_settings(&self, defaults: &ChatSettings) -> Result<ChatSettings> {
        let context = OpContext::chat("materialize_settings", defaults.chat_id);
        let mut settings = self.settings.write().await;
        let record = settings
            .entry(defaults.chat_id)
            .or_insert_with(|| ChatSettings::empty(defaults.chat_id));
        if record.is_complete() && record.updated_at.is_some() {
            return Ok(record.clone());
        }
        record.fill_missing(defaults);
        record.updated_at.get_or_insert_with(Utc::now);
        let out = record.clone();
        self.flush_settings(&settings, context).await?;
        Ok(out)
    }
}
