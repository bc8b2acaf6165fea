//! Embedding backfill: closes the gap between stored messages and vectors.
//!
//! Each pass asks the backend for the oldest embeddable messages without a
//! vector, embeds them one by one and writes each vector with a targeted
//! update. Messages that fail are remembered for the rest of the run so a
//! single bad message cannot stall the job. A run ends when a pass finds no
//! candidates. Cancellation is checked between messages and during the
//! inter-batch sleep, never in the middle of a vector write.

use std::collections::HashSet;
use std::sync::Arc;

use embedding::{EmbeddingError, EmbeddingService};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::StorageBackend;
use crate::config::{BackfillConfig, Timeouts};
use crate::error::{OpContext, Result, StorageError};
use crate::models::{Message, MessageKey};
use crate::timeout::bounded;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub embedded: usize,
    pub failed: usize,
    /// Candidates deleted before their vector could be written.
    pub vanished: usize,
    /// Passes that found at least one candidate.
    pub passes: usize,
    pub cancelled: bool,
}

pub struct EmbeddingBackfillWorker {
    backend: Arc<dyn StorageBackend>,
    embedder: Arc<dyn EmbeddingService>,
    config: BackfillConfig,
    timeouts: Timeouts,
}

impl EmbeddingBackfillWorker {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        embedder: Arc<dyn EmbeddingService>,
        config: BackfillConfig,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            backend,
            embedder,
            config,
            timeouts,
        }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Embeds and stores the vector for one message. `Ok(false)` means the
    /// message was deleted in the meantime.
    async fn embed_one(&self, message: &Message) -> Result<bool> {
        let context = OpContext::message("backfill_embed", message.chat_id, message.message_id);
        let vector = bounded(self.timeouts.embed, context, async {
            self.embedder
                .embed(&message.embedding_text())
                .await
                .map_err(StorageError::from)
        })
        .await?;

        if let Some(expected) = self.backend.capabilities().embedding_dim {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                }
                .into());
            }
        }

        bounded(
            self.timeouts.io,
            OpContext::message("set_embedding", message.chat_id, message.message_id),
            self.backend
                .set_embedding(message.chat_id, message.message_id, &vector),
        )
        .await
    }

    /// Runs passes until one finds no candidates or `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn run_until_converged(&self, cancel: &CancellationToken) -> Result<BackfillReport> {
        let mut skip: HashSet<MessageKey> = HashSet::new();
        let mut report = BackfillReport::default();

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let candidates = bounded(
                self.timeouts.io,
                OpContext::new("find_unembedded"),
                self.backend.find_unembedded(self.config.batch_size, &skip),
            )
            .await?;
            if candidates.is_empty() {
                break;
            }
            report.passes += 1;
            debug!(pass = report.passes, candidates = candidates.len(), "Backfill pass");

            for message in &candidates {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                match self.embed_one(message).await {
                    Ok(true) => report.embedded += 1,
                    Ok(false) => {
                        debug!(
                            chat_id = message.chat_id,
                            message_id = message.message_id,
                            "Message deleted before its vector was stored"
                        );
                        report.vanished += 1;
                    }
                    Err(e) => {
                        warn!(
                            chat_id = message.chat_id,
                            message_id = message.message_id,
                            error = %e,
                            "Backfill embedding failed; skipping for this run"
                        );
                        skip.insert(message.key());
                        report.failed += 1;
                    }
                }
            }
            if report.cancelled {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(self.config.batch_delay) => {}
            }
        }

        info!(
            embedded = report.embedded,
            failed = report.failed,
            vanished = report.vanished,
            passes = report.passes,
            cancelled = report.cancelled,
            "Embedding backfill finished"
        );
        Ok(report)
    }

    /// Runs [`run_until_converged`](Self::run_until_converged) every
    /// `config.interval` until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.run_until_converged(&cancel).await {
                            Ok(_) => {}
                            Err(e) if e.is_unsupported() => {
                                warn!(error = %e, "Backend cannot store vectors; backfill stopped");
                                break;
                            }
                            Err(e) => warn!(error = %e, "Embedding backfill run failed"),
                        }
                    }
                }
            }
            info!("Embedding backfill worker stopped");
        })
    }
}
