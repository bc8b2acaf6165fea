//! dbot-memory: maintenance CLI for chat memory. Config from env (.env is loaded first).

use anyhow::{Context, Result};
use chat_storage::StorageFacade;
use clap::Parser;
use dbot_cli::{
    build_embedder, commands, init_tracing, load_storage_config, log_file_from_env, Cli, Commands,
    SettingsCommand,
};
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&log_file_from_env())?;

    let config = load_storage_config()?;
    let embedder = build_embedder(&config)?;
    let facade = StorageFacade::open(&config, embedder)
        .await
        .with_context(|| format!("Open {} storage backend", config.backend))?;

    let result = match cli.command {
        Commands::Maintain => commands::maintain(&facade, &config).await,
        Commands::Backfill { batch_size } => commands::backfill(&facade, &config, batch_size).await,
        Commands::Cleanup { chat_id } => commands::cleanup(&facade, &config, chat_id).await,
        Commands::Stats { chat_id } => commands::stats(&facade, chat_id).await,
        Commands::Recent { chat_id, limit } => commands::recent(&facade, chat_id, limit).await,
        Commands::Search { chat_id, query, k } => {
            commands::search(&facade, chat_id, &query, k).await
        }
        Commands::Settings { command } => match command {
            SettingsCommand::Get { chat_id } => commands::settings_get(&facade, chat_id).await,
            SettingsCommand::Set {
                chat_id,
                field,
                value,
            } => commands::settings_set(&facade, chat_id, &field, &value).await,
        },
        Commands::Clear { chat_id, yes } => commands::clear(&facade, chat_id, yes).await,
    };

    if let Err(e) = facade.close().await {
        warn!(error = %e, "Closing storage failed");
    }
    result
}
