//! Per-(chat, user) profile record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutable summary of a user inside one chat. Callers pass the complete
/// desired state on upsert; the store only refreshes `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub chat_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_alias: String,
    #[serde(default)]
    pub gender_or_tag: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub freeform_bio: String,
    #[serde(default)]
    pub auto_bio: String,
    #[serde(default)]
    pub last_auto_bio_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            chat_id,
            user_id,
            username: String::new(),
            display_alias: String::new(),
            gender_or_tag: String::new(),
            real_name: String::new(),
            freeform_bio: String::new(),
            auto_bio: String::new(),
            last_auto_bio_update: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Name to address the user by: alias, then real name, then username.
    pub fn display_name(&self) -> &str {
        [&self.display_alias, &self.real_name, &self.username]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Most recently seen first; never-seen profiles last, then by user id.
pub fn sort_by_recency(profiles: &mut [UserProfile]) {
    profiles.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}
