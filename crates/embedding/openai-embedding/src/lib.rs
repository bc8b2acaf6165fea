//! # OpenAI Embedding Service
//!
//! Implementation of the [`EmbeddingService`] trait on top of OpenAI's
//! embeddings API (or any OpenAI-compatible endpoint via a base URL).
//!
//! ## Example
//!
//! ```rust,no_run
//! use openai_embedding::OpenAIEmbedding;
//! use embedding::EmbeddingService;
//!
//! async fn example() -> Result<(), embedding::EmbeddingError> {
//!     let service = OpenAIEmbedding::new("sk-...".to_string(), "text-embedding-3-small".to_string());
//!     let vector = service.embed("Hello world").await?;
//!     println!("Embedding dimension: {}", vector.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Timeouts
//!
//! Each request is bounded (30s single, 60s batch by default) so a stuck
//! provider never holds a storage worker indefinitely. Override with
//! [`OpenAIEmbedding::with_timeout`].

use std::time::Duration;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use embedding::{ensure_non_empty, EmbeddingError, EmbeddingService};
use tracing::{debug, info, instrument, warn};

const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(60);
const LOG_PREVIEW_LEN: usize = 200;

/// OpenAI embedding service. Holds the async-openai client and model name.
#[derive(Debug, Clone)]
pub struct OpenAIEmbedding {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    batch_timeout: Duration,
}

impl OpenAIEmbedding {
    /// Creates a new OpenAI embedding service. An empty `api_key` falls back to `OPENAI_API_KEY`.
    pub fn new(api_key: String, model: String) -> Self {
        Self::new_with_base_url(api_key, model, None)
    }

    /// Creates a service that sends requests to `base_url` when set (OpenAI-compatible endpoints).
    pub fn new_with_base_url(api_key: String, model: String, base_url: Option<&str>) -> Self {
        let api_key = if api_key.is_empty() {
            std::env::var("OPENAI_API_KEY").unwrap_or_default()
        } else {
            api_key
        };

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url.filter(|s| !s.is_empty()) {
            openai_config = openai_config.with_api_base(url);
        }

        Self {
            client: Client::with_config(openai_config),
            model,
            timeout: DEFAULT_EMBED_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }

    /// Overrides the single-request timeout; the batch timeout is twice this value.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.batch_timeout = timeout * 2;
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(LOG_PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl EmbeddingService for OpenAIEmbedding {
    #[instrument(skip(self, text), fields(model = %self.model, text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        ensure_non_empty(text)?;
        info!(text_preview = %preview(text), "step: embedding OpenAI embed request");

        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(vec![text])
            .build()
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;

        let embeddings = self.client.embeddings();
        let response = match tokio::time::timeout(self.timeout, embeddings.create(request)).await {
            Ok(Ok(r)) => {
                debug!("OpenAI embed response received");
                r
            }
            Ok(Err(e)) => {
                warn!(error = %e, "OpenAI embed request failed");
                return Err(EmbeddingError::Provider(e.to_string()));
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "OpenAI embed request timed out");
                return Err(EmbeddingError::Timeout(self.timeout));
            }
        };

        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or(EmbeddingError::EmptyResponse)?;

        info!(dimension = embedding.len(), "step: embedding OpenAI embed done");
        Ok(embedding)
    }

    #[instrument(skip(self, texts), fields(model = %self.model, batch_size = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            debug!("OpenAI embed_batch empty input, skipping");
            return Ok(vec![]);
        }
        for text in texts {
            ensure_non_empty(text)?;
        }

        let inputs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input(inputs)
            .build()
            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;

        let embeddings = self.client.embeddings();
        let response =
            match tokio::time::timeout(self.batch_timeout, embeddings.create(request)).await {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    warn!(error = %e, "OpenAI embed_batch request failed");
                    return Err(EmbeddingError::Provider(e.to_string()));
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.batch_timeout.as_secs(),
                        "OpenAI embed_batch request timed out"
                    );
                    return Err(EmbeddingError::Timeout(self.batch_timeout));
                }
            };

        let mut data = response.data;
        data.sort_by_key(|item| item.index);
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();

        if vectors.len() != texts.len() {
            warn!(
                expected = texts.len(),
                got = vectors.len(),
                "OpenAI embed_batch response count mismatch"
            );
            return Err(EmbeddingError::Provider(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        info!(
            count = vectors.len(),
            dimension = vectors.first().map(|v| v.len()).unwrap_or(0),
            "step: embedding OpenAI embed_batch done"
        );
        Ok(vectors)
    }
}
