//! desync CLI
//!
//! Command-line interface for the ClientHello desynchronization engine.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use desync_core::config::{Config, LoggingConfig};
use tracing::error;

use args::Args;
use commands::Command;
use logging::LogSettings;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // The [logging] section is read before the command loads the file for real
    let file_logging = commands::config::resolve_path(args.config.as_deref())
        .and_then(|path| Config::load(path).ok())
        .map(|config| config.logging)
        .unwrap_or_else(LoggingConfig::default);
    let _log_guard = logging::init(&LogSettings::resolve(&args, &file_logging))?;

    if !args.quiet && matches!(args.command, Command::Run(_) | Command::Discover(_)) {
        print_banner();
    }

    let result = run(args);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args) -> Result<()> {
    let config_path = args.config.as_deref();
    match args.command {
        Command::Run(run_args) => commands::run::execute(run_args, config_path),
        Command::Discover(discover_args) => commands::discover::execute(discover_args, config_path),
        Command::Config(config_args) => commands::config::execute(config_args, config_path),
        Command::Completions(comp_args) => commands::completions::execute(comp_args),
    }
}

fn print_banner() {
    use colored::Colorize;

    eprintln!();
    eprintln!(
        "{} {}",
        "desync".green().bold(),
        env!("CARGO_PKG_VERSION").dimmed()
    );
    eprintln!("{}", "ClientHello desynchronization engine".white());
    eprintln!();
}
