//! Persistent chat memory: messages, user profiles, per-chat settings,
//! semantic search, embedding backfill and size-based retention.
//!
//! ## Modules
//!
//! - [`models`] – Message, UserProfile, ChatSettings and the settings patch type
//! - [`backend`] – StorageBackend trait implemented by every store
//! - [`sqlite`] – SqliteBackend (no vectors)
//! - [`file`] – FileBackend, JSON files with an in-process cache
//! - `lance` – LanceBackend with vector search (feature `lance`)
//! - [`facade`] – StorageFacade, the single entry point
//! - [`settings`] – SettingsStore with default-overlay resolution
//! - [`backfill`] – EmbeddingBackfillWorker
//! - [`retention`] – RetentionManager
//! - [`config`] – StorageConfig loaded from the environment
//! - [`session`] – backend selection at startup

pub mod backend;
pub mod backfill;
pub mod config;
pub mod error;
pub mod facade;
pub mod file;
#[cfg(feature = "lance")]
pub mod lance;
pub mod models;
pub mod retention;
pub mod session;
pub mod settings;
pub mod sqlite;
mod timeout;

pub use backend::{BackendCapabilities, StorageBackend};
pub use backfill::{BackfillReport, EmbeddingBackfillWorker};
pub use config::{BackendKind, BackfillConfig, RetentionConfig, StorageConfig, Timeouts};
pub use error::{OpContext, Result, StorageError};
pub use facade::StorageFacade;
pub use file::FileBackend;
#[cfg(feature = "lance")]
pub use lance::{LanceBackend, LanceConfig};
pub use models::{
    ChatSettings, DirectReplyLimit, ForwardOrigin, Message, MessageKey, ResolvedChatSettings,
    SafetyThreshold, ScoredMessage, SettingsDefaults, SettingsField, SettingsPatch, UserProfile,
};
pub use retention::{CycleReport, RetentionManager, RetentionOutcome, RetentionState};
pub use session::open_backend;
pub use settings::SettingsStore;
pub use sqlite::{SqliteBackend, SqlitePoolManager};
