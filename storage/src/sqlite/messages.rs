//! Message queries for the SQLite backend.
//!
//! Timestamps are stored as Unix milliseconds so range filters and ordering
//! are plain integer comparisons.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{OpContext, Result, StorageError};
use crate::models::{ForwardOrigin, Message, MESSAGE_ROW_OVERHEAD_BYTES};

use super::{db_err, from_millis};

const SELECT_COLUMNS: &str = "chat_id, message_id, user_id, is_bot, timestamp_ms, text, caption, \
     reply_to_message_id, has_media, is_voice, is_forward, forward_from_user_id, \
     forward_from_chat_id, forward_from_message_id, forwarded_at_ms";

fn row_to_message(row: &SqliteRow) -> std::result::Result<Message, sqlx::Error> {
    let timestamp_ms: i64 = row.try_get("timestamp_ms")?;
    let is_forward: bool = row.try_get("is_forward")?;
    let forward = if is_forward {
        let forwarded_at_ms: Option<i64> = row.try_get("forwarded_at_ms")?;
        Some(ForwardOrigin {
            from_user_id: row.try_get("forward_from_user_id")?,
            from_chat_id: row.try_get("forward_from_chat_id")?,
            from_message_id: row.try_get("forward_from_message_id")?,
            forwarded_at: forwarded_at_ms.and_then(from_millis),
        })
    } else {
        None
    };

    Ok(Message {
        chat_id: row.try_get("chat_id")?,
        message_id: row.try_get("message_id")?,
        user_id: row.try_get("user_id")?,
        is_bot: row.try_get("is_bot")?,
        timestamp: from_millis(timestamp_ms).unwrap_or_default(),
        text: row.try_get("text")?,
        caption: row.try_get("caption")?,
        reply_to_message_id: row.try_get("reply_to_message_id")?,
        has_media: row.try_get("has_media")?,
        is_voice: row.try_get("is_voice")?,
        forward,
        embedding: None,
    })
}

fn rows_to_messages(rows: &[SqliteRow], context: OpContext) -> Result<Vec<Message>> {
    rows.iter()
        .map(|row| row_to_message(row).map_err(|e| StorageError::serialization(context, e)))
        .collect()
}

pub(super) async fn upsert(pool: &SqlitePool, message: &Message) -> Result<()> {
    let context = OpContext::message("upsert_message", message.chat_id, message.message_id);
    let forward = message.forward.as_ref();

    sqlx::query(
        r#"
        INSERT INTO chat_messages (
            chat_id, message_id, user_id, is_bot, timestamp_ms, text, caption,
            reply_to_message_id, has_media, is_voice, is_forward, forward_from_user_id,
            forward_from_chat_id, forward_from_message_id, forwarded_at_ms
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chat_id, message_id) DO UPDATE SET
            user_id = excluded.user_id,
            is_bot = excluded.is_bot,
            timestamp_ms = excluded.timestamp_ms,
            text = excluded.text,
            caption = excluded.caption,
            reply_to_message_id = excluded.reply_to_message_id,
            has_media = excluded.has_media,
            is_voice = excluded.is_voice,
            is_forward = excluded.is_forward,
            forward_from_user_id = excluded.forward_from_user_id,
            forward_from_chat_id = excluded.forward_from_chat_id,
            forward_from_message_id = excluded.forward_from_message_id,
            forwarded_at_ms = excluded.forwarded_at_ms
        "#,
    )
    .bind(message.chat_id)
    .bind(message.message_id)
    .bind(message.user_id)
    .bind(message.is_bot)
    .bind(message.timestamp.timestamp_millis())
    .bind(&message.text)
    .bind(&message.caption)
    .bind(message.reply_to_message_id)
    .bind(message.has_media)
    .bind(message.is_voice)
    .bind(forward.is_some())
    .bind(forward.map(|f| f.from_user_id).unwrap_or(0))
    .bind(forward.map(|f| f.from_chat_id).unwrap_or(0))
    .bind(forward.map(|f| f.from_message_id).unwrap_or(0))
    .bind(forward.and_then(|f| f.forwarded_at).map(|t| t.timestamp_millis()))
    .execute(pool)
    .await
    .map_err(db_err(context))?;

    Ok(())
}

pub(super) async fn get(pool: &SqlitePool, chat_id: i64, message_id: i64) -> Result<Option<Message>> {
    let context = OpContext::message("get_message", chat_id, message_id);
    let sql = format!(
        "SELECT {} FROM chat_messages WHERE chat_id = ? AND message_id = ?",
        SELECT_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(chat_id)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err(context))?;

    row.map(|r| row_to_message(&r).map_err(|e| StorageError::serialization(context, e)))
        .transpose()
}

pub(super) async fn recent(pool: &SqlitePool, chat_id: i64, limit: usize) -> Result<Vec<Message>> {
    let context = OpContext::chat("recent_messages", chat_id);
    let sql = format!(
        "SELECT {} FROM chat_messages WHERE chat_id = ? \
         ORDER BY timestamp_ms DESC, message_id DESC LIMIT ?",
        SELECT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(chat_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .map_err(db_err(context))?;

    let mut messages = rows_to_messages(&rows, context)?;
    messages.reverse();
    Ok(messages)
}

pub(super) async fn since(
    pool: &SqlitePool,
    chat_id: i64,
    user_id: Option<i64>,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Message>> {
    let context = OpContext::chat("messages_since", chat_id);
    let mut sql = format!(
        "SELECT {} FROM chat_messages WHERE chat_id = ? AND timestamp_ms >= ?",
        SELECT_COLUMNS
    );
    if user_id.is_some() {
        sql.push_str(" AND user_id = ?");
    }
    sql.push_str(" ORDER BY timestamp_ms DESC, message_id DESC LIMIT ?");

    let mut query = sqlx::query(&sql).bind(chat_id).bind(since.timestamp_millis());
    if let Some(uid) = user_id {
        query = query.bind(uid);
    }
    let rows = query
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .map_err(db_err(context))?;

    let mut messages = rows_to_messages(&rows, context)?;
    messages.reverse();
    Ok(messages)
}

pub(super) async fn delete_chat(pool: &SqlitePool, chat_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chat_messages WHERE chat_id = ?")
        .bind(chat_id)
        .execute(pool)
        .await
        .map_err(db_err(OpContext::chat("delete_chat_messages", chat_id)))?;
    Ok(result.rows_affected())
}

pub(super) async fn chat_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT DISTINCT chat_id FROM chat_messages ORDER BY chat_id")
            .fetch_all(pool)
            .await
            .map_err(db_err(OpContext::new("list_chat_ids")))?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub(super) async fn storage_bytes(pool: &SqlitePool, chat_id: i64) -> Result<u64> {
    let (bytes,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(
            COUNT(*) * ? + SUM(LENGTH(CAST(text AS BLOB)) + LENGTH(CAST(caption AS BLOB))),
            0
        )
        FROM chat_messages WHERE chat_id = ?
        "#,
    )
    .bind(MESSAGE_ROW_OVERHEAD_BYTES as i64)
    .bind(chat_id)
    .fetch_one(pool)
    .await
    .map_err(db_err(OpContext::chat("chat_storage_bytes", chat_id)))?;
    Ok(bytes.max(0) as u64)
}

pub(super) async fn oldest_time(pool: &SqlitePool, chat_id: i64) -> Result<Option<DateTime<Utc>>> {
    let (oldest,): (Option<i64>,) =
        sqlx::query_as("SELECT MIN(timestamp_ms) FROM chat_messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(pool)
            .await
            .map_err(db_err(OpContext::chat("oldest_message_time", chat_id)))?;
    Ok(oldest.and_then(from_millis))
}

pub(super) async fn delete_before(
    pool: &SqlitePool,
    chat_id: i64,
    before: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chat_messages WHERE chat_id = ? AND timestamp_ms < ?")
        .bind(chat_id)
        .bind(before.timestamp_millis())
        .execute(pool)
        .await
        .map_err(db_err(OpContext::chat("delete_messages_before", chat_id)))?;
    Ok(result.rows_affected())
}
