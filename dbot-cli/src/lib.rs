//! # dbot-cli
//!
//! Maintenance CLI for chat memory: argument parsing, config loading, logging
//! setup and the command handlers behind the `dbot-memory` binary.

pub mod cli;
pub mod commands;
pub mod logger;

pub use cli::{build_embedder, load_storage_config, Cli, Commands, SettingsCommand};
pub use logger::{init_tracing, log_file_from_env, DEFAULT_LOG_FILE};
