//! CLI parser, config loading and embedding service construction.

use std::sync::Arc;

use anyhow::{Context, Result};
use chat_storage::StorageConfig;
use clap::{Parser, Subcommand};
use embedding::{EmbeddingService, EnvEmbeddingConfig};
use openai_embedding::OpenAIEmbedding;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "dbot-memory")]
#[command(about = "Chat memory maintenance: workers, backfill, cleanup, inspection", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the embedding backfill and retention workers until Ctrl-C.
    Maintain,
    /// Embed every stored message that still lacks a vector, then exit.
    Backfill {
        #[arg(short, long)]
        batch_size: Option<usize>,
    },
    /// Run one retention pass over all chats, or only the given chat.
    Cleanup {
        #[arg(long, allow_negative_numbers = true)]
        chat_id: Option<i64>,
    },
    /// Footprint, profiles and settings of one chat.
    Stats {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
    },
    /// Most recent messages of a chat, oldest first.
    Recent {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Semantic search inside one chat.
    Search {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
        query: String,
        #[arg(short, default_value = "5")]
        k: usize,
    },
    /// Read or change per-chat settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Delete every message of a chat. Profiles and settings are kept.
    Clear {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
        /// Required: the deletion cannot be undone.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum SettingsCommand {
    /// Resolved settings (stored values over defaults).
    Get {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
    },
    /// Set one field, e.g. `settings set -100123 temperature 0.4`.
    Set {
        #[arg(allow_negative_numbers = true)]
        chat_id: i64,
        field: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
}

/// Loads and validates storage config from the environment.
pub fn load_storage_config() -> Result<StorageConfig> {
    let config = StorageConfig::from_env();
    config
        .validate()
        .context("Invalid storage configuration (check STORAGE_* / BACKFILL_* / RETENTION_* env)")?;
    Ok(config)
}

/// Builds the embedding service when long-term memory is enabled.
///
/// A missing or unsupported provider only disables semantic features; commands
/// that need embeddings check for `None` themselves.
pub fn build_embedder(config: &StorageConfig) -> Result<Option<Arc<dyn EmbeddingService>>> {
    if !config.long_term_memory_enabled {
        return Ok(None);
    }
    let embedding = EnvEmbeddingConfig::from_env()?;
    if let Err(e) = embedding.validate() {
        warn!(error = %e, "Embedding provider not usable; semantic features disabled");
        return Ok(None);
    }
    let service = OpenAIEmbedding::new_with_base_url(
        embedding.openai_api_key.clone(),
        embedding.embedding_model.clone(),
        embedding.openai_base_url.as_deref(),
    )
    .with_timeout(config.timeouts.embed);
    Ok(Some(Arc::new(service)))
}
