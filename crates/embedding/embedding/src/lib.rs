//! # Text Embeddings
//!
//! This crate defines the embedding service interface used by chat memory to
//! turn message text into vectors for semantic search and backfill.
//!
//! Implementations live in separate crates (e.g. `openai-embedding`). Every
//! implementation must reject empty input with [`EmbeddingError::EmptyInput`]
//! before any network call; [`ensure_non_empty`] does that check.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod config;
pub use config::{EmbeddingConfig, EnvEmbeddingConfig};

/// Errors produced by an embedding provider. All of them are recoverable from
/// the storage layer's point of view: the message is kept and embedded later.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding input is empty")]
    EmptyInput,

    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding provider error: {0}")]
    Provider(String),

    #[error("embedding response contained no vectors")]
    EmptyResponse,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Service for generating text embeddings.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Generates an embedding vector for a single text string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Generates embedding vectors for multiple texts in a single API call.
    /// The default implementation calls [`EmbeddingService::embed`] once per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Rejects empty or whitespace-only input.
pub fn ensure_non_empty(text: &str) -> Result<(), EmbeddingError> {
    if text.trim().is_empty() {
        return Err(EmbeddingError::EmptyInput);
    }
    Ok(())
}
