//! Document store with vector search, over LanceDB.
//!
//! Three tables: `messages` (scalar filter columns, JSON document, nullable
//! vector), `profiles` and `settings` (JSON documents). Writes go through
//! `merge_insert` on the record key, so duplicate delivery is an update.
//! Vector writes only touch rows that still exist with the document they were
//! read with. Range reads scan the scalar key columns first and fetch full
//! rows only for the keys they return.
//! The ANN index is created under the configured name once enough vectored
//! rows exist to train it; until then searches scan.

mod config;
mod schema;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch, RecordBatchIterator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::index::Index;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType, Table};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendCapabilities, StorageBackend};
use crate::error::{OpContext, Result, StorageError};
use crate::models::{
    rank_by_similarity, sort_by_recency, sort_chronologically, ChatSettings, Message, MessageKey,
    ScoredMessage, SettingsPatch, UserProfile,
};

pub use config::LanceConfig;
use schema::{
    column, distances_from_batch, docs_from_batch, messages_from_batch, messages_schema,
    messages_to_batch, profile_to_batch, profiles_schema, settings_schema, settings_to_batch,
    MESSAGES_TABLE, PROFILES_TABLE, SETTINGS_TABLE, VECTOR_COLUMN,
};

fn lance_err(context: OpContext) -> impl FnOnce(lancedb::Error) -> StorageError {
    move |e| StorageError::database(context, e)
}

/// LanceDB-backed [`StorageBackend`].
pub struct LanceBackend {
    config: LanceConfig,
    _db: Connection,
    messages: Table,
    profiles: Table,
    settings: Table,
    /// Per-chat guards for settings read-modify-write.
    settings_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    index_ready: AtomicBool,
}

impl LanceBackend {
    /// Connects (creating the database if needed) and provisions tables.
    pub async fn with_config(config: LanceConfig) -> Result<Self> {
        let context = OpContext::new("open");
        info!(db_path = %config.db_path, dim = config.embedding_dim, "Connecting to LanceDB");
        let db = lancedb::connect(&config.db_path)
            .execute()
            .await
            .map_err(lance_err(context))?;

        let messages =
            open_or_create(&db, MESSAGES_TABLE, messages_schema(config.embedding_dim)).await?;
        let profiles = open_or_create(&db, PROFILES_TABLE, profiles_schema()).await?;
        let settings = open_or_create(&db, SETTINGS_TABLE, settings_schema()).await?;

        let indices = messages
            .list_indices()
            .await
            .map_err(lance_err(OpContext::new("list_indices")))?;
        let index_ready = indices.iter().any(|i| i.name == config.vector_index_name);
        debug!(index = %config.vector_index_name, exists = index_ready, "Vector index status");

        Ok(Self {
            config,
            _db: db,
            messages,
            profiles,
            settings,
            settings_locks: Mutex::new(HashMap::new()),
            index_ready: AtomicBool::new(index_ready),
        })
    }

    pub fn config(&self) -> &LanceConfig {
        &self.config
    }

    /// Creates the named ANN index once enough vectored rows exist.
    async fn maybe_create_index(&self) -> Result<()> {
        if self.index_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let context = OpContext::new("create_index");
        let vectored = self
            .messages
            .count_rows(Some("has_vector = true".to_string()))
            .await
            .map_err(lance_err(context))?;
        if vectored < self.config.index_min_rows {
            return Ok(());
        }
        if self.index_ready.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(index = %self.config.vector_index_name, rows = vectored, "Creating vector index");
        let created = self
            .messages
            .create_index(&[VECTOR_COLUMN], Index::Auto)
            .name(self.config.vector_index_name.clone())
            .execute()
            .await;
        if let Err(e) = created {
            self.index_ready.store(false, Ordering::Release);
            warn!(error = %e, "Vector index creation failed; searches keep scanning");
        }
        Ok(())
    }

    async fn merge_messages(&self, messages: &[Message], context: OpContext) -> Result<()> {
        let batch = messages_to_batch(
            messages_schema(self.config.embedding_dim),
            messages,
            self.config.embedding_dim,
            context,
        )?;
        merge(&self.messages, &["chat_id", "message_id"], batch, context).await
    }

    /// Writes `vector` onto `current` if the stored row still carries the same
    /// document. A row deleted since the read is not reinserted.
    async fn store_vector(&self, mut current: Message, vector: &[f32], context: OpContext) -> Result<()> {
        current.embedding = Some(vector.to_vec());
        let batch = messages_to_batch(
            messages_schema(self.config.embedding_dim),
            std::slice::from_ref(&current),
            self.config.embedding_dim,
            context,
        )?;
        update_matched(
            &self.messages,
            &["chat_id", "message_id"],
            batch,
            "target.doc = source.doc",
            context,
        )
        .await
    }

    async fn settings_lock(&self, chat_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.settings_locks.lock().await;
        locks.entry(chat_id).or_default().clone()
    }

    /// `(timestamp_ms, chat_id, message_id)` of the rows matching `filter`,
    /// read from the scalar columns only.
    async fn row_keys(&self, filter: String, context: OpContext) -> Result<Vec<(i64, i64, i64)>> {
        let query = self
            .messages
            .query()
            .only_if(filter)
            .select(Select::columns(&["timestamp_ms", "chat_id", "message_id"]));
        let batches = collect(query, context).await?;
        let mut keys = Vec::new();
        for batch in &batches {
            let times = column::<Int64Array>(batch, "timestamp_ms", context)?;
            let chats = column::<Int64Array>(batch, "chat_id", context)?;
            let ids = column::<Int64Array>(batch, "message_id", context)?;
            for row in 0..batch.num_rows() {
                keys.push((times.value(row), chats.value(row), ids.value(row)));
            }
        }
        Ok(keys)
    }

    /// Full rows for `keys`, one query per chat.
    async fn messages_by_keys(&self, keys: &[(i64, i64, i64)], context: OpContext) -> Result<Vec<Message>> {
        let mut by_chat: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for (_, chat_id, message_id) in keys {
            by_chat.entry(*chat_id).or_default().push(message_id.to_string());
        }
        let mut messages = Vec::with_capacity(keys.len());
        for (chat_id, ids) in by_chat {
            let filter = format!("chat_id = {} AND message_id IN ({})", chat_id, ids.join(", "));
            messages.extend(self.query_messages(filter, context).await?);
        }
        Ok(messages)
    }

    /// The newest `limit` rows matching `filter`, oldest first.
    async fn latest_matching(&self, filter: String, limit: usize, context: OpContext) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut keys = self.row_keys(filter, context).await?;
        keys.sort_unstable();
        let newest = &keys[keys.len().saturating_sub(limit)..];
        let mut messages = self.messages_by_keys(newest, context).await?;
        sort_chronologically(&mut messages);
        Ok(messages)
    }

    async fn query_messages(&self, filter: String, context: OpContext) -> Result<Vec<Message>> {
        let batches = collect(self.messages.query().only_if(filter), context).await?;
        let mut messages = Vec::new();
        for batch in &batches {
            messages.extend(messages_from_batch(batch, context)?);
        }
        Ok(messages)
    }

    async fn int_column(&self, filter: String, name: &str, context: OpContext) -> Result<Vec<i64>> {
        let query = self
            .messages
            .query()
            .only_if(filter)
            .select(Select::columns(&[name]));
        let batches = collect(query, context).await?;
        let mut values = Vec::new();
        for batch in &batches {
            values.extend(column::<Int64Array>(batch, name, context)?.values().iter().copied());
        }
        Ok(values)
    }

    async fn load_settings(&self, chat_id: i64, context: OpContext) -> Result<Option<ChatSettings>> {
        let query = self.settings.query().only_if(format!("chat_id = {}", chat_id));
        let batches = collect(query, context).await?;
        for batch in &batches {
            if let Some(record) = docs_from_batch::<ChatSettings>(batch, context)?.into_iter().next() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn store_settings(&self, record: &ChatSettings, context: OpContext) -> Result<()> {
        let batch = settings_to_batch(record, context)?;
        merge(&self.settings, &["chat_id"], batch, context).await
    }
}

async fn open_or_create(
    db: &Connection,
    name: &str,
    schema: arrow_schema::SchemaRef,
) -> Result<Table> {
    let context = OpContext::new("open_table");
    let names = db
        .table_names()
        .execute()
        .await
        .map_err(lance_err(context))?;
    if names.iter().any(|n| n == name) {
        return db.open_table(name).execute().await.map_err(lance_err(context));
    }
    info!(table = name, "Creating Lance table");
    db.create_empty_table(name, schema)
        .execute()
        .await
        .map_err(lance_err(context))
}

async fn merge(table: &Table, on: &[&str], batch: RecordBatch, context: OpContext) -> Result<()> {
    let schema = batch.schema();
    let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
    let mut merge_insert = table.merge_insert(on);
    merge_insert
        .when_matched_update_all(None)
        .when_not_matched_insert_all();
    merge_insert
        .execute(Box::new(reader))
        .await
        .map_err(lance_err(context))?;
    Ok(())
}

/// Merge that only updates matched rows satisfying `condition`; unmatched
/// source rows are dropped.
async fn update_matched(
    table: &Table,
    on: &[&str],
    batch: RecordBatch,
    condition: &str,
    context: OpContext,
) -> Result<()> {
    let schema = batch.schema();
    let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
    let mut merge_insert = table.merge_insert(on);
    merge_insert.when_matched_update_all(Some(condition.to_string()));
    merge_insert
        .execute(Box::new(reader))
        .await
        .map_err(lance_err(context))?;
    Ok(())
}

async fn collect<Q>(query: Q, context: OpContext) -> Result<Vec<RecordBatch>>
where
    Q: ExecutableQuery + Send + Sync,
{
    query
        .execute()
        .await
        .map_err(lance_err(context))?
        .try_collect::<Vec<_>>()
        .await
        .map_err(|e| StorageError::database(context, e))
}

#[async_trait]
impl StorageBackend for LanceBackend {
    fn name(&self) -> &'static str {
        "lance"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            vector_search: true,
            embedding_dim: Some(self.config.embedding_dim),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.messages
            .count_rows(None)
            .await
            .map_err(lance_err(OpContext::new("health_check")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("LanceDB backend closed");
        Ok(())
    }

    async fn upsert_message(&self, message: &Message) -> Result<()> {
        let context = OpContext::message("upsert_message", message.chat_id, message.message_id);
        self.merge_messages(std::slice::from_ref(message), context).await?;
        if message.embedding.is_some() {
            self.maybe_create_index().await?;
        }
        Ok(())
    }

    async fn get_message(&self, chat_id: i64, message_id: i64) -> Result<Option<Message>> {
        let context = OpContext::message("get_message", chat_id, message_id);
        let filter = format!("chat_id = {} AND message_id = {}", chat_id, message_id);
        Ok(self.query_messages(filter, context).await?.into_iter().next())
    }

    async fn recent_messages(&self, chat_id: i64, limit: usize) -> Result<Vec<Message>> {
        let context = OpContext::chat("recent_messages", chat_id);
        self.latest_matching(format!("chat_id = {}", chat_id), limit, context)
            .await
    }

    async fn messages_since(
        &self,
        chat_id: i64,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let context = OpContext::chat("messages_since", chat_id);
        let mut filter = format!(
            "chat_id = {} AND timestamp_ms >= {}",
            chat_id,
            since.timestamp_millis()
        );
        if let Some(uid) = user_id {
            filter.push_str(&format!(" AND user_id = {}", uid));
        }
        let mut matching = self.latest_matching(filter, limit, context).await?;
        // Millisecond column filter; refine on the exact timestamp.
        matching.retain(|m| m.timestamp >= since);
        Ok(matching)
    }

    async fn delete_chat_messages(&self, chat_id: i64) -> Result<u64> {
        let context = OpContext::chat("delete_chat_messages", chat_id);
        let filter = format!("chat_id = {}", chat_id);
        let count = self
            .messages
            .count_rows(Some(filter.clone()))
            .await
            .map_err(lance_err(context))?;
        if count > 0 {
            self.messages.delete(&filter).await.map_err(lance_err(context))?;
        }
        Ok(count as u64)
    }

    async fn list_chat_ids(&self) -> Result<Vec<i64>> {
        let context = OpContext::new("list_chat_ids");
        let query = self.messages.query().select(Select::columns(&["chat_id"]));
        let batches = collect(query, context).await?;
        let mut ids = BTreeSet::new();
        for batch in &batches {
            ids.extend(column::<Int64Array>(batch, "chat_id", context)?.values().iter().copied());
        }
        Ok(ids.into_iter().collect())
    }

    async fn search_similar(&self, chat_id: i64, query: &[f32], k: usize) -> Result<Vec<ScoredMessage>> {
        let context = OpContext::chat("search_similar", chat_id);
        if query.len() != self.config.embedding_dim {
            return Err(StorageError::Validation(format!(
                "query vector has {} dimensions, table stores {}",
                query.len(),
                self.config.embedding_dim
            )));
        }
        let mut vector_query = self
            .messages
            .query()
            .nearest_to(query)
            .map_err(lance_err(context))?
            .column(VECTOR_COLUMN)
            .distance_type(DistanceType::Cosine)
            .only_if(format!("chat_id = {} AND has_vector = true", chat_id))
            .limit(k);
        if self.config.use_exact_search {
            vector_query = vector_query.bypass_vector_index();
        }
        if let Some(nprobes) = self.config.nprobes {
            vector_query = vector_query.nprobes(nprobes);
        }

        let batches = collect(vector_query, context).await?;
        let mut results = Vec::new();
        for batch in &batches {
            let scores = distances_from_batch(batch);
            for (message, score) in messages_from_batch(batch, context)?.into_iter().zip(scores) {
                results.push(ScoredMessage { score, message });
            }
        }
        rank_by_similarity(&mut results);
        results.truncate(k);
        debug!(chat_id, k, returned = results.len(), "Lance vector search returned");
        Ok(results)
    }

    async fn find_unembedded(&self, limit: usize, skip: &HashSet<MessageKey>) -> Result<Vec<Message>> {
        let context = OpContext::new("find_unembedded");
        let mut keys: Vec<(i64, i64, i64)> = self
            .row_keys("embeddable = true AND has_vector = false".to_string(), context)
            .await?
            .into_iter()
            .filter(|(_, chat_id, message_id)| !skip.contains(&MessageKey::new(*chat_id, *message_id)))
            .collect();
        keys.sort_unstable();
        keys.truncate(limit);

        let mut candidates = self.messages_by_keys(&keys, context).await?;
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
        let Some(current) = self.get_message(chat_id, message_id).await? else {
            debug!(chat_id, message_id, "set_embedding: message no longer exists");
            return Ok(false);
        };
        self.store_vector(current, vector, context).await?;
        self.maybe_create_index().await?;
        Ok(true)
    }

    async fn chat_storage_bytes(&self, chat_id: i64) -> Result<u64> {
        let context = OpContext::chat("chat_storage_bytes", chat_id);
        let sizes = self
            .int_column(format!("chat_id = {}", chat_id), "size_bytes", context)
            .await?;
        Ok(sizes.into_iter().map(|s| s.max(0) as u64).sum())
    }

    async fn oldest_message_time(&self, chat_id: i64) -> Result<Option<DateTime<Utc>>> {
        let context = OpContext::chat("oldest_message_time", chat_id);
        let times = self
            .int_column(format!("chat_id = {}", chat_id), "timestamp_ms", context)
            .await?;
        Ok(times.into_iter().min().and_then(DateTime::from_timestamp_millis))
    }

    async fn delete_messages_before(&self, chat_id: i64, before: DateTime<Utc>) -> Result<u64> {
        let context = OpContext::chat("delete_messages_before", chat_id);
        let filter = format!(
            "chat_id = {} AND timestamp_ms < {}",
            chat_id,
            before.timestamp_millis()
        );
        let count = self
            .messages
            .count_rows(Some(filter.clone()))
            .await
            .map_err(lance_err(context))?;
        if count > 0 {
            self.messages.delete(&filter).await.map_err(lance_err(context))?;
        }
        Ok(count as u64)
    }

    async fn get_profile(&self, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
        let context = OpContext::chat("get_profile", chat_id);
        let query = self
            .profiles
            .query()
            .only_if(format!("chat_id = {} AND user_id = {}", chat_id, user_id));
        let batches = collect(query, context).await?;
        for batch in &batches {
            if let Some(p) = docs_from_batch::<UserProfile>(batch, context)?.into_iter().next() {
                return Ok(Some(p));
            }
        }
        Ok(None)
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        let context = OpContext::chat("upsert_profile", profile.chat_id);
        let batch = profile_to_batch(profile, context)?;
        merge(&self.profiles, &["chat_id", "user_id"], batch, context).await
    }

    async fn list_profiles(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        let context = OpContext::chat("list_profiles", chat_id);
        let query = self.profiles.query().only_if(format!("chat_id = {}", chat_id));
        let batches = collect(query, context).await?;
        let mut profiles = Vec::new();
        for batch in &batches {
            profiles.extend(docs_from_batch::<UserProfile>(batch, context)?);
        }
        sort_by_recency(&mut profiles);
        Ok(profiles)
    }

    async fn get_settings(&self, chat_id: i64) -> Result<Option<ChatSettings>> {
        self.load_settings(chat_id, OpContext::chat("get_settings", chat_id))
            .await
    }

    async fn upsert_settings(&self, record: &ChatSettings) -> Result<()> {
        let context = OpContext::chat("upsert_settings", record.chat_id);
        let lock = self.settings_lock(record.chat_id).await;
        let _guard = lock.lock().await;
        let mut record = record.clone();
        record.updated_at = Some(Utc::now());
        self.store_settings(&record, context).await
    }

    async fn patch_settings(&self, chat_id: i64, patch: &SettingsPatch) -> Result<ChatSettings> {
        let context = OpContext::chat("patch_settings", chat_id);
        let lock = self.settings_lock(chat_id).await;
        let _guard = lock.lock().await;
        let mut record = self
            .load_settings(chat_id, context)
            .await?
            .unwrap_or_else(|| ChatSettings::empty(chat_id));
        patch.apply(&mut record);
        record.updated_at = Some(Utc::now());
        self.store_settings(&record, context).await?;
        Ok(record)
    }

    async fn materialize_settings(&self, defaults: &ChatSettings) -> Result<ChatSettings> {
        let context = OpContext::chat("materialize_settings", defaults.chat_id);
        let lock = self.settings_lock(defaults.chat_id).await;
        let _guard = lock.lock().await;
        let mut record = self
            .load_settings(defaults.chat_id, context)
            .await?
            .unwrap_or_else(|| ChatSettings::empty(defaults.chat_id));
        if record.is_complete() && record.updated_at.is_some() {
            return Ok(record);
        }
        record.fill_missing(defaults);
        record.updated_at.get_or_insert_with(Utc::now);
        self.store_settings(&record, context).await?;
        Ok(record)
    }
}
