//! Command handlers. Each one takes an opened [`StorageFacade`] and prints to stdout.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chat_storage::{
    BackfillConfig, EmbeddingBackfillWorker, Message, ResolvedChatSettings, RetentionManager,
    RetentionOutcome, StorageConfig, StorageFacade,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const TEXT_PREVIEW_LEN: usize = 80;

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
    });
}

fn backfill_worker(
    facade: &StorageFacade,
    config: BackfillConfig,
    storage: &StorageConfig,
) -> Result<EmbeddingBackfillWorker> {
    let Some(embedder) = facade.embedder().cloned() else {
        bail!("Backfill needs LONG_TERM_MEMORY_ENABLED=true and a usable embedding provider");
    };
    if !facade.backend().capabilities().vector_search {
        bail!(
            "The {} backend does not store vectors; backfill is not available",
            facade.backend().name()
        );
    }
    Ok(EmbeddingBackfillWorker::new(
        facade.backend().clone(),
        embedder,
        config,
        storage.timeouts,
    ))
}

/// Runs both background workers until Ctrl-C.
pub async fn maintain(facade: &StorageFacade, config: &StorageConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let retention = Arc::new(RetentionManager::new(
        facade.backend().clone(),
        config.retention.clone(),
        config.timeouts.io,
    ));
    let mut handles = vec![retention.spawn(cancel.clone())];

    match backfill_worker(facade, config.backfill.clone(), config) {
        Ok(worker) => handles.push(Arc::new(worker).spawn(cancel.clone())),
        Err(e) => info!(reason = %e, "Embedding backfill worker not started"),
    }

    info!(workers = handles.len(), "Maintenance running; press Ctrl-C to stop");
    for handle in handles {
        handle.await.context("Worker task failed")?;
    }
    Ok(())
}

pub async fn backfill(
    facade: &StorageFacade,
    config: &StorageConfig,
    batch_size: Option<usize>,
) -> Result<()> {
    let mut backfill_config = config.backfill.clone();
    if let Some(batch_size) = batch_size.filter(|n| *n > 0) {
        backfill_config.batch_size = batch_size;
    }
    let worker = backfill_worker(facade, backfill_config, config)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let report = worker.run_until_converged(&cancel).await?;

    println!(
        "Embedded: {}, Failed: {}, Deleted meanwhile: {}, Passes: {}{}",
        report.embedded,
        report.failed,
        report.vanished,
        report.passes,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

pub async fn cleanup(facade: &StorageFacade, config: &StorageConfig, chat_id: Option<i64>) -> Result<()> {
    let manager = RetentionManager::new(
        facade.backend().clone(),
        config.retention.clone(),
        config.timeouts.io,
    );

    let Some(chat_id) = chat_id else {
        let report = manager.run_cycle(&CancellationToken::new()).await?;
        println!(
            "Checked: {}, Trimmed: {}, Deleted: {}, Failures: {}",
            report.chats_checked, report.chats_trimmed, report.messages_deleted, report.failures
        );
        return Ok(());
    };

    match manager.evaluate_chat(chat_id).await? {
        RetentionOutcome::UnderLimit { size_bytes } => println!(
            "Chat {} is under the limit ({} of {} bytes)",
            chat_id, size_bytes, config.retention.max_size_bytes
        ),
        RetentionOutcome::Trimmed {
            size_before,
            deleted,
            boundary,
        } => println!(
            "Chat {}: deleted {} message(s) older than {} (was {} bytes)",
            chat_id,
            deleted,
            boundary.format("%Y-%m-%d %H:%M:%S"),
            size_before
        ),
    }
    Ok(())
}

pub async fn stats(facade: &StorageFacade, chat_id: i64) -> Result<()> {
    let state = facade.chat_state(chat_id).await?;
    let profiles = facade.list_profiles(chat_id).await?;
    let settings = facade.get_settings(chat_id).await?;

    println!("Chat {} ({} backend)", chat_id, facade.backend().name());
    println!("  size:     {} bytes", state.size_bytes);
    println!(
        "  oldest:   {}",
        state
            .oldest
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  profiles: {}", profiles.len());
    for p in profiles.iter().take(10) {
        let name = match p.display_name() {
            "" => "-",
            name => name,
        };
        println!("    {:<12} {}", p.user_id, name);
    }
    print_settings(&settings);
    Ok(())
}

pub async fn recent(facade: &StorageFacade, chat_id: i64, limit: usize) -> Result<()> {
    let messages = facade.get_recent(chat_id, limit).await?;
    if messages.is_empty() {
        println!("No messages in chat {}.", chat_id);
        return Ok(());
    }
    println!("{:<10} {:<20} {:<12} {:<6} {}", "id", "timestamp", "user_id", "vec", "text");
    println!("{}", "-".repeat(100));
    for m in &messages {
        print_message(m, None);
    }
    Ok(())
}

pub async fn search(facade: &StorageFacade, chat_id: i64, query: &str, k: usize) -> Result<()> {
    if !facade.semantic_search_enabled() {
        bail!("Semantic search needs LONG_TERM_MEMORY_ENABLED=true and a usable embedding provider");
    }
    let results = facade.search_relevant(chat_id, query, k).await?;
    if results.is_empty() {
        println!("No relevant messages.");
        return Ok(());
    }
    for r in &results {
        print_message(&r.message, Some(r.score));
    }
    Ok(())
}

pub async fn settings_get(facade: &StorageFacade, chat_id: i64) -> Result<()> {
    let settings = facade.get_settings(chat_id).await?;
    print_settings(&settings);
    Ok(())
}

pub async fn settings_set(facade: &StorageFacade, chat_id: i64, field: &str, value: &str) -> Result<()> {
    let settings = facade.settings().set(chat_id, field, value).await?;
    print_settings(&settings);
    Ok(())
}

pub async fn clear(facade: &StorageFacade, chat_id: i64, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to delete chat {} without --yes", chat_id);
    }
    let deleted = facade.clear_chat(chat_id).await?;
    println!("Deleted {} message(s) from chat {}.", deleted, chat_id);
    Ok(())
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    match flat.char_indices().nth(TEXT_PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

fn print_message(m: &Message, score: Option<f32>) {
    let text = if m.text.is_empty() { &m.caption } else { &m.text };
    let prefix = score.map(|s| format!("[{:.3}] ", s)).unwrap_or_default();
    println!(
        "{}{:<10} {:<20} {:<12} {:<6} {}",
        prefix,
        m.message_id,
        m.timestamp.format("%Y-%m-%d %H:%M:%S"),
        m.user_id,
        if m.embedding.is_some() { "yes" } else { "no" },
        preview(text)
    );
}

fn print_settings(s: &ResolvedChatSettings) {
    println!("Settings for chat {}:", s.chat_id);
    println!("  conversation_style:             {}", s.conversation_style);
    println!("  temperature:                    {}", s.temperature);
    println!("  model:                          {}", s.model);
    println!("  safety_threshold:               {}", s.safety_threshold);
    println!("  voice_transcription_enabled:    {}", s.voice_transcription_enabled);
    println!("  direct_reply_limit_enabled:     {}", s.direct_reply_limit.enabled);
    println!("  direct_reply_limit_count:       {}", s.direct_reply_limit.count);
    println!(
        "  direct_reply_limit_window_secs: {}",
        s.direct_reply_limit.window.as_secs()
    );
    println!("  srach_analysis_enabled:         {}", s.srach_analysis_enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), TEXT_PREVIEW_LEN + 3);
        assert_eq!(preview("a\nb"), "a b");
    }

    #[tokio::test]
    async fn test_clear_requires_confirmation() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: chat_storage::BackendKind::File,
            file_store_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let facade = StorageFacade::open(&config, None).await.unwrap();
        facade
            .add_message(&Message::new(1, 1, 5, chrono::Utc::now(), "keep me"))
            .await
            .unwrap();

        assert!(clear(&facade, 1, false).await.is_err());
        assert_eq!(facade.get_recent(1, 10).await.unwrap().len(), 1);

        clear(&facade, 1, true).await.unwrap();
        assert!(facade.get_recent(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_requires_embedder() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: chat_storage::BackendKind::File,
            file_store_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let facade = StorageFacade::open(&config, None).await.unwrap();
        assert!(backfill(&facade, &config, None).await.is_err());
    }
}
