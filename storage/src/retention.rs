//! Size-triggered retention.
//!
//! Each cycle measures every chat's footprint. A chat strictly over the limit
//! loses all messages older than `oldest + chunk`; messages at or after that
//! boundary stay. New messages are never older than the oldest one, so
//! concurrent inserts are never caught in a chunk delete.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::StorageBackend;
use crate::config::RetentionConfig;
use crate::error::{OpContext, Result};
use crate::timeout::bounded;

/// Footprint snapshot of one chat. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionState {
    pub chat_id: i64,
    pub size_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionOutcome {
    UnderLimit {
        size_bytes: u64,
    },
    Trimmed {
        size_before: u64,
        deleted: u64,
        boundary: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub chats_checked: usize,
    pub chats_trimmed: usize,
    pub messages_deleted: u64,
    pub failures: usize,
    pub cancelled: bool,
}

/// First timestamp that survives a trim anchored at `oldest`.
pub fn chunk_boundary(oldest: DateTime<Utc>, chunk: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(chunk)
        .ok()
        .and_then(|d| oldest.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) async fn measure(
    backend: &dyn StorageBackend,
    chat_id: i64,
    io_timeout: Duration,
) -> Result<RetentionState> {
    let size_bytes = bounded(
        io_timeout,
        OpContext::chat("chat_storage_bytes", chat_id),
        backend.chat_storage_bytes(chat_id),
    )
    .await?;
    let oldest = bounded(
        io_timeout,
        OpContext::chat("oldest_message_time", chat_id),
        backend.oldest_message_time(chat_id),
    )
    .await?;
    Ok(RetentionState {
        chat_id,
        size_bytes,
        oldest,
    })
}

pub struct RetentionManager {
    backend: Arc<dyn StorageBackend>,
    config: RetentionConfig,
    io_timeout: Duration,
}

impl RetentionManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: RetentionConfig, io_timeout: Duration) -> Self {
        Self {
            backend,
            config,
            io_timeout,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub async fn measure(&self, chat_id: i64) -> Result<RetentionState> {
        measure(self.backend.as_ref(), chat_id, self.io_timeout).await
    }

    /// Trims one chunk from the chat if it is over the limit.
    #[instrument(skip(self))]
    pub async fn evaluate_chat(&self, chat_id: i64) -> Result<RetentionOutcome> {
        let state = self.measure(chat_id).await?;
        let oldest = match state.oldest {
            Some(oldest) if state.size_bytes > self.config.max_size_bytes => oldest,
            _ => {
                debug!(chat_id, size_bytes = state.size_bytes, "Chat under retention limit");
                return Ok(RetentionOutcome::UnderLimit {
                    size_bytes: state.size_bytes,
                });
            }
        };

        let boundary = chunk_boundary(oldest, self.config.chunk);
        let deleted = bounded(
            self.io_timeout,
            OpContext::chat("delete_messages_before", chat_id),
            self.backend.delete_messages_before(chat_id, boundary),
        )
        .await?;
        info!(
            chat_id,
            size_bytes = state.size_bytes,
            max_size_bytes = self.config.max_size_bytes,
            oldest = %oldest,
            boundary = %boundary,
            deleted,
            "Retention chunk deleted"
        );
        Ok(RetentionOutcome::Trimmed {
            size_before: state.size_bytes,
            deleted,
            boundary,
        })
    }

    /// Evaluates every chat once. A failure on one chat is logged and counted;
    /// the rest are still evaluated.
    #[instrument(skip(self, cancel))]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let chat_ids = bounded(
            self.io_timeout,
            OpContext::new("list_chat_ids"),
            self.backend.list_chat_ids(),
        )
        .await?;

        let mut report = CycleReport::default();
        for chat_id in chat_ids {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.chats_checked += 1;
            match self.evaluate_chat(chat_id).await {
                Ok(RetentionOutcome::Trimmed { deleted, .. }) => {
                    report.chats_trimmed += 1;
                    report.messages_deleted += deleted;
                }
                Ok(RetentionOutcome::UnderLimit { .. }) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(chat_id, error = %e, "Retention check failed; retrying next cycle");
                }
            }
        }
        info!(
            checked = report.chats_checked,
            trimmed = report.chats_trimmed,
            deleted = report.messages_deleted,
            failures = report.failures,
            "Retention cycle finished"
        );
        Ok(report)
    }

    /// Runs [`run_cycle`](Self::run_cycle) every `check_interval` until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle(&cancel).await {
                            warn!(error = %e, "Retention cycle failed");
                        }
                    }
                }
            }
            info!("Retention manager stopped");
        })
    }
}
