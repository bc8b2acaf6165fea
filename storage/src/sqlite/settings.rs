//! Settings queries for the SQLite backend. One nullable column per field;
//! NULL means "not set for this chat".

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{OpContext, Result, StorageError};
use crate::models::{ChatSettings, SafetyThreshold, SettingsPatch};

use super::db_err;

fn row_to_settings(row: &SqliteRow) -> std::result::Result<ChatSettings, String> {
    let get_err = |e: sqlx::Error| e.to_string();
    let temperature: Option<f64> = row.try_get("temperature").map_err(get_err)?;
    let safety: Option<String> = row.try_get("safety_threshold").map_err(get_err)?;
    let count: Option<i64> = row.try_get("direct_reply_limit_count").map_err(get_err)?;
    let window: Option<i64> = row
        .try_get("direct_reply_limit_window_secs")
        .map_err(get_err)?;

    Ok(ChatSettings {
        chat_id: row.try_get("chat_id").map_err(get_err)?,
        conversation_style: row.try_get("conversation_style").map_err(get_err)?,
        temperature: temperature.map(|t| t as f32),
        model: row.try_get("model").map_err(get_err)?,
        safety_threshold: safety
            .map(|s| s.parse::<SafetyThreshold>())
            .transpose()
            .map_err(|e: StorageError| e.to_string())?,
        voice_transcription_enabled: row
            .try_get("voice_transcription_enabled")
            .map_err(get_err)?,
        direct_reply_limit_enabled: row
            .try_get("direct_reply_limit_enabled")
            .map_err(get_err)?,
        direct_reply_limit_count: count
            .map(u32::try_from)
            .transpose()
            .map_err(|e| e.to_string())?,
        direct_reply_limit_window_secs: window
            .map(u64::try_from)
            .transpose()
            .map_err(|e| e.to_string())?,
        srach_analysis_enabled: row.try_get("srach_analysis_enabled").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

pub(super) async fn get(pool: &SqlitePool, chat_id: i64) -> Result<Option<ChatSettings>> {
    let context = OpContext::chat("get_settings", chat_id);
    let row = sqlx::query("SELECT * FROM chat_settings WHERE chat_id = ?")
        .bind(chat_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err(context))?;

    row.map(|r| row_to_settings(&r).map_err(|e| StorageError::serialization(context, e)))
        .transpose()
}

async fn get_required(pool: &SqlitePool, chat_id: i64, operation: &'static str) -> Result<ChatSettings> {
    get(pool, chat_id).await?.ok_or_else(|| {
        StorageError::database(OpContext::chat(operation, chat_id), "settings row missing after write")
    })
}

/// Writes `settings` with the given conflict policy. `merge` keeps stored
/// non-NULL values (fill-only); otherwise every column is replaced.
async fn write(pool: &SqlitePool, settings: &ChatSettings, merge: bool, context: OpContext) -> Result<()> {
    let assign = |col: &str| {
        if merge {
            format!("{col} = COALESCE(chat_settings.{col}, excluded.{col})")
        } else {
            format!("{col} = excluded.{col}")
        }
    };
    let columns = [
        "conversation_style",
        "temperature",
        "model",
        "safety_threshold",
        "voice_transcription_enabled",
        "direct_reply_limit_enabled",
        "direct_reply_limit_count",
        "direct_reply_limit_window_secs",
        "srach_analysis_enabled",
        "updated_at",
    ];
    let updates: Vec<String> = columns.iter().map(|c| assign(c)).collect();
    let sql = format!(
        "INSERT INTO chat_settings (chat_id, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(chat_id) DO UPDATE SET {}",
        columns.join(", "),
        updates.join(", ")
    );

    sqlx::query(&sql)
        .bind(settings.chat_id)
        .bind(&settings.conversation_style)
        .bind(settings.temperature.map(f64::from))
        .bind(&settings.model)
        .bind(settings.safety_threshold.map(|s| s.as_str()))
        .bind(settings.voice_transcription_enabled)
        .bind(settings.direct_reply_limit_enabled)
        .bind(settings.direct_reply_limit_count.map(i64::from))
        .bind(
            settings
                .direct_reply_limit_window_secs
                .map(|w| i64::try_from(w).unwrap_or(i64::MAX)),
        )
        .bind(settings.srach_analysis_enabled)
        .bind(settings.updated_at.unwrap_or_else(Utc::now))
        .execute(pool)
        .await
        .map_err(db_err(context))?;
    Ok(())
}

pub(super) async fn upsert(pool: &SqlitePool, settings: &ChatSettings) -> Result<()> {
    let context = OpContext::chat("upsert_settings", settings.chat_id);
    let mut record = settings.clone();
    record.updated_at = Some(Utc::now());
    write(pool, &record, false, context).await
}

pub(super) async fn patch(pool: &SqlitePool, chat_id: i64, patch: &SettingsPatch) -> Result<ChatSettings> {
    let context = OpContext::chat("patch_settings", chat_id);
    let column = patch.field().as_str();
    let sql = format!(
        "INSERT INTO chat_settings (chat_id, {column}, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(chat_id) DO UPDATE SET {column} = excluded.{column}, updated_at = excluded.updated_at"
    );
    let query = sqlx::query(&sql).bind(chat_id);
    let query = match patch {
        SettingsPatch::ConversationStyle(v) | SettingsPatch::Model(v) => query.bind(v.clone()),
        SettingsPatch::Temperature(v) => query.bind(f64::from(*v)),
        SettingsPatch::SafetyThreshold(v) => query.bind(v.as_str()),
        SettingsPatch::VoiceTranscription(v)
        | SettingsPatch::DirectReplyLimitEnabled(v)
        | SettingsPatch::SrachAnalysis(v) => query.bind(*v),
        SettingsPatch::DirectReplyLimitCount(v) => query.bind(*v),
        SettingsPatch::DirectReplyLimitWindow(v) => {
            query.bind(i64::try_from(v.as_secs()).unwrap_or(i64::MAX))
        }
    };
    query
        .bind(Utc::now())
        .execute(pool)
        .await
        .map_err(db_err(context))?;

    get_required(pool, chat_id, "patch_settings").await
}

pub(super) async fn materialize(pool: &SqlitePool, defaults: &ChatSettings) -> Result<ChatSettings> {
    let context = OpContext::chat("materialize_settings", defaults.chat_id);
    let mut record = defaults.clone();
    record.updated_at = Some(Utc::now());
    write(pool, &record, true, context).await?;
    get_required(pool, defaults.chat_id, "materialize_settings").await
}
