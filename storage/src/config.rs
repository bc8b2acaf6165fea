//! Storage configuration loaded from environment variables.
//!
//! Unparseable values fall back to their defaults; [`StorageConfig::validate`]
//! rejects values that parse but make no sense (zero batch size, and so on).
//! The loaded value is immutable and handed to each component at construction.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::models::{parse_bool, DirectReplyLimit, SafetyThreshold, SettingsDefaults};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Which physical store backs the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    File,
    Lance,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "file" => Ok(BackendKind::File),
            "lance" | "lancedb" => Ok(BackendKind::Lance),
            other => Err(StorageError::Config(format!("unknown storage backend: {}", other))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::File => "file",
            BackendKind::Lance => "lance",
        })
    }
}

/// Embedding backfill job parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillConfig {
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Period between full runs when spawned as a background task.
    pub interval: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(1000),
            interval: Duration::from_secs(3600),
        }
    }
}

/// Size-triggered cleanup parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    /// A chat is trimmed when its footprint exceeds this many bytes.
    pub max_size_bytes: u64,
    pub check_interval: Duration,
    /// Width of the time span removed from the oldest end in one pass.
    pub chunk: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * BYTES_PER_MB,
            check_interval: Duration::from_secs(3600),
            chunk: Duration::from_secs(24 * 3600),
        }
    }
}

/// Per-call time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Plain reads and writes.
    pub io: Duration,
    pub embed: Duration,
    pub search: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            io: Duration::from_secs(5),
            embed: Duration::from_secs(30),
            search: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub database_url: String,
    pub file_store_dir: String,
    pub lance_db_path: String,
    pub embedding_dim: usize,
    pub vector_index_name: String,
    /// Messages returned by `recent_context`.
    pub context_window: usize,
    pub long_term_memory_enabled: bool,
    pub backfill: BackfillConfig,
    pub retention: RetentionConfig,
    pub timeouts: Timeouts,
    pub settings_defaults: SettingsDefaults,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            database_url: "./data/chat_memory.db".to_string(),
            file_store_dir: "./data/file_store".to_string(),
            lance_db_path: "./data/lancedb".to_string(),
            embedding_dim: 1536,
            vector_index_name: "message_embedding_index".to_string(),
            context_window: 30,
            long_term_memory_enabled: false,
            backfill: BackfillConfig::default(),
            retention: RetentionConfig::default(),
            timeouts: Timeouts::default(),
            settings_defaults: SettingsDefaults::default(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

impl SettingsDefaults {
    /// Loads the per-field defaults from `DEFAULT_*` variables.
    pub fn from_env() -> Self {
        let d = SettingsDefaults::default();
        Self {
            conversation_style: env_string("DEFAULT_CONVERSATION_STYLE", &d.conversation_style),
            temperature: env_parse("DEFAULT_TEMPERATURE", d.temperature),
            model: env_string("DEFAULT_MODEL", &d.model),
            safety_threshold: env::var("DEFAULT_SAFETY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse::<SafetyThreshold>().ok())
                .unwrap_or(d.safety_threshold),
            voice_transcription_enabled: env_bool(
                "DEFAULT_VOICE_TRANSCRIPTION",
                d.voice_transcription_enabled,
            ),
            direct_reply_limit: DirectReplyLimit {
                enabled: env_bool(
                    "DEFAULT_DIRECT_REPLY_LIMIT_ENABLED",
                    d.direct_reply_limit.enabled,
                ),
                count: env_parse("DEFAULT_DIRECT_REPLY_LIMIT_COUNT", d.direct_reply_limit.count),
                window: Duration::from_secs(env_parse(
                    "DEFAULT_DIRECT_REPLY_LIMIT_WINDOW_SECS",
                    d.direct_reply_limit.window.as_secs(),
                )),
            },
            srach_analysis_enabled: env_bool("DEFAULT_SRACH_ANALYSIS", d.srach_analysis_enabled),
        }
    }
}

impl StorageConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Self {
        let d = StorageConfig::default();
        Self {
            backend: env::var("STORAGE_BACKEND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.backend),
            database_url: env_string("DATABASE_URL", &d.database_url),
            file_store_dir: env_string("FILE_STORE_DIR", &d.file_store_dir),
            lance_db_path: env_string("LANCE_DB_PATH", &d.lance_db_path),
            embedding_dim: env_parse("LANCE_EMBEDDING_DIM", d.embedding_dim),
            vector_index_name: env_string("VECTOR_INDEX_NAME", &d.vector_index_name),
            context_window: env_parse("CONTEXT_WINDOW", d.context_window),
            long_term_memory_enabled: env_bool(
                "LONG_TERM_MEMORY_ENABLED",
                d.long_term_memory_enabled,
            ),
            backfill: BackfillConfig {
                batch_size: env_parse("BACKFILL_BATCH_SIZE", d.backfill.batch_size),
                batch_delay: Duration::from_millis(env_parse(
                    "BACKFILL_DELAY_MS",
                    d.backfill.batch_delay.as_millis() as u64,
                )),
                interval: Duration::from_secs(env_parse(
                    "BACKFILL_INTERVAL_SECS",
                    d.backfill.interval.as_secs(),
                )),
            },
            retention: RetentionConfig {
                max_size_bytes: env_parse(
                    "RETENTION_MAX_SIZE_MB",
                    d.retention.max_size_bytes / BYTES_PER_MB,
                )
                .saturating_mul(BYTES_PER_MB),
                check_interval: Duration::from_secs(env_parse(
                    "RETENTION_CHECK_INTERVAL_SECS",
                    d.retention.check_interval.as_secs(),
                )),
                chunk: Duration::from_secs(
                    env_parse::<u64>("RETENTION_CHUNK_HOURS", d.retention.chunk.as_secs() / 3600)
                        .saturating_mul(3600),
                ),
            },
            timeouts: Timeouts {
                io: Duration::from_secs(env_parse(
                    "STORAGE_IO_TIMEOUT_SECS",
                    d.timeouts.io.as_secs(),
                )),
                embed: Duration::from_secs(env_parse(
                    "EMBED_TIMEOUT_SECS",
                    d.timeouts.embed.as_secs(),
                )),
                search: Duration::from_secs(env_parse(
                    "VECTOR_SEARCH_TIMEOUT_SECS",
                    d.timeouts.search.as_secs(),
                )),
            },
            settings_defaults: SettingsDefaults::from_env(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StorageError::Config(msg.to_string()));
        if self.context_window == 0 {
            return invalid("CONTEXT_WINDOW must be greater than 0");
        }
        if self.embedding_dim == 0 {
            return invalid("LANCE_EMBEDDING_DIM must be greater than 0");
        }
        if self.vector_index_name.trim().is_empty() {
            return invalid("VECTOR_INDEX_NAME must not be empty");
        }
        if self.backfill.batch_size == 0 {
            return invalid("BACKFILL_BATCH_SIZE must be greater than 0");
        }
        if self.backfill.interval.is_zero() {
            return invalid("BACKFILL_INTERVAL_SECS must be greater than 0");
        }
        if self.retention.max_size_bytes == 0 {
            return invalid("RETENTION_MAX_SIZE_MB must be greater than 0");
        }
        if self.retention.check_interval.is_zero() {
            return invalid("RETENTION_CHECK_INTERVAL_SECS must be greater than 0");
        }
        if self.retention.chunk.is_zero() {
            return invalid("RETENTION_CHUNK_HOURS must be greater than 0");
        }
        if self.timeouts.io.is_zero() || self.timeouts.embed.is_zero() || self.timeouts.search.is_zero() {
            return invalid("timeouts must be greater than 0");
        }
        self.settings_defaults
            .validate()
            .map_err(|e| StorageError::Config(format!("invalid settings default: {}", e)))
    }
}
