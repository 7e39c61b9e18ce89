//! CLI commands

pub mod completions;
pub mod config;
pub mod discover;
pub mod run;

use anyhow::{Context, Result};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Intercept the configured queues and rewrite matching handshakes
    Run(run::RunArgs),

    /// Search for a configuration that unblocks a host
    Discover(discover::DiscoverArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}

/// Token cancelled on Ctrl-C or SIGTERM
pub(crate) fn interrupt_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler = token.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal");
        handler.cancel();
    })
    .context("Failed to set signal handler")?;
    Ok(token)
}
