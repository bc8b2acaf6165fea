//! Profile queries for the SQLite backend.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{OpContext, Result, StorageError};
use crate::models::UserProfile;

use super::db_err;

fn row_to_profile(row: &SqliteRow) -> std::result::Result<UserProfile, sqlx::Error> {
    Ok(UserProfile {
        chat_id: row.try_get("chat_id")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        display_alias: row.try_get("display_alias")?,
        gender_or_tag: row.try_get("gender_or_tag")?,
        real_name: row.try_get("real_name")?,
        freeform_bio: row.try_get("freeform_bio")?,
        auto_bio: row.try_get("auto_bio")?,
        last_auto_bio_update: row.try_get("last_auto_bio_update")?,
        last_seen: row.try_get("last_seen")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(super) async fn get(pool: &SqlitePool, chat_id: i64, user_id: i64) -> Result<Option<UserProfile>> {
    let context = OpContext::chat("get_profile", chat_id);
    let row = sqlx::query("SELECT * FROM user_profiles WHERE chat_id = ? AND user_id = ?")
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err(context))?;

    row.map(|r| row_to_profile(&r).map_err(|e| StorageError::serialization(context, e)))
        .transpose()
}

pub(super) async fn upsert(pool: &SqlitePool, profile: &UserProfile) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_profiles (
            chat_id, user_id, username, display_alias, gender_or_tag, real_name,
            freeform_bio, auto_bio, last_auto_bio_update, last_seen, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chat_id, user_id) DO UPDATE SET
            username = excluded.username,
            display_alias = excluded.display_alias,
            gender_or_tag = excluded.gender_or_tag,
            real_name = excluded.real_name,
            freeform_bio = excluded.freeform_bio,
            auto_bio = excluded.auto_bio,
            last_auto_bio_update = excluded.last_auto_bio_update,
            last_seen = excluded.last_seen,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(profile.chat_id)
    .bind(profile.user_id)
    .bind(&profile.username)
    .bind(&profile.display_alias)
    .bind(&profile.gender_or_tag)
    .bind(&profile.real_name)
    .bind(&profile.freeform_bio)
    .bind(&profile.auto_bio)
    .bind(profile.last_auto_bio_update)
    .bind(profile.last_seen)
    .bind(profile.created_at)
    .bind(profile.updated_at)
    .execute(pool)
    .await
    .map_err(db_err(OpContext::chat("upsert_profile", profile.chat_id)))?;
    Ok(())
}

pub(super) async fn list(pool: &SqlitePool, chat_id: i64) -> Result<Vec<UserProfile>> {
    let context = OpContext::chat("list_profiles", chat_id);
    let rows = sqlx::query(
        "SELECT * FROM user_profiles WHERE chat_id = ? \
         ORDER BY last_seen IS NULL, last_seen DESC, user_id",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await
    .map_err(db_err(context))?;

    rows.iter()
        .map(|r| row_to_profile(r).map_err(|e| StorageError::serialization(context, e)))
        .collect()
}
