//! Data model shared by every backend.

mod message;
mod profile;
mod settings;

pub use message::{
    cosine_similarity, rank_by_similarity, sort_chronologically, ForwardOrigin, Message,
    MessageKey, ScoredMessage, MESSAGE_ROW_OVERHEAD_BYTES,
};
pub use profile::{sort_by_recency, UserProfile};
pub use settings::{
    parse_bool, ChatSettings, DirectReplyLimit, ResolvedChatSettings, SafetyThreshold,
    SettingsDefaults, SettingsField, SettingsPatch,
};
