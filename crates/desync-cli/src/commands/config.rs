//! Config command - configuration management

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use desync_core::config::{Config, StrategyFamily, TunableParameter};
use desync_platform::RuleBuilder;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default configuration file name
pub const CONFIG_FILE: &str = "desync.toml";

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Show a family preset instead of the configuration file
        #[arg(short, long)]
        family: Option<StrategyFamily>,
    },

    /// Generate a configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = CONFIG_FILE)]
        output: PathBuf,

        /// Strategy family for the generated target set
        #[arg(short, long, default_value = "tcp_frag")]
        family: StrategyFamily,

        /// Domains of the generated target set
        #[arg(short, long = "domain", value_name = "DOMAIN")]
        domains: Vec<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Config file to validate (default: --config or the search path)
        file: Option<PathBuf>,
    },

    /// Print the nftables rules feeding the configured queues
    Rules {
        /// nftables table name
        #[arg(long, default_value = "desync")]
        table: String,
    },

    /// List strategy families and their tunable parameter
    Families,

    /// Show config file locations
    Paths,
}

/// Execute config command
pub fn execute(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        ConfigAction::Show { family } => show_config(config_path, family),
        ConfigAction::Generate {
            output,
            family,
            domains,
            force,
        } => generate_config(&output, family, domains, force),
        ConfigAction::Validate { file } => validate_config(file.as_deref().or(config_path)),
        ConfigAction::Rules { table } => {
            let config = load_or_default(config_path)?;
            print!("{}", render_rules(&config, &table));
            Ok(())
        }
        ConfigAction::Families => {
            print!("{}", render_families());
            Ok(())
        }
        ConfigAction::Paths => show_paths(),
    }
}

/// Candidate configuration files, in search order
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dirs) = directories::ProjectDirs::from("", "", "desync") {
        paths.push(dirs.config_dir().join(CONFIG_FILE));
    }
    paths.push(PathBuf::from("/etc/desync").join(CONFIG_FILE));
    paths
}

/// The explicit path, or the first existing file on the search path
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| search_paths().into_iter().find(|p| p.exists()))
}

/// Load and validate a configuration file
pub fn load(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// The resolved configuration file, or defaults when none exists
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config> {
    match resolve_path(explicit) {
        Some(path) => load(&path),
        None => Ok(Config::default()),
    }
}

fn show_config(config_path: Option<&Path>, family: Option<StrategyFamily>) -> Result<()> {
    let config = match family {
        Some(family) => Config::from_family(family, Vec::new()),
        None => load_or_default(config_path)?,
    };
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

/// Configuration file text for a family preset
pub fn render_generated(family: StrategyFamily, domains: Vec<String>) -> Result<String> {
    let config = Config::from_family(family, domains);
    config.validate().context("Generated configuration is invalid")?;
    let toml_str = config.to_toml().context("Failed to serialize config")?;
    Ok(format!(
        "# desync configuration\n\
         # Generated from the {family} preset\n\
         # Run `desync config rules` for the matching nftables rules\n\n\
         {toml_str}"
    ))
}

fn generate_config(
    output: &Path,
    family: StrategyFamily,
    domains: Vec<String>,
    force: bool,
) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", output.display());
    }
    let content = render_generated(family, domains)?;
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), %family, "generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn validate_config(file: Option<&Path>) -> Result<()> {
    let path = resolve_path(file).context("No configuration file found")?;
    let config = load(&path)?;

    println!("✓ Configuration is valid: {}", path.display());
    println!(
        "  Queues: {}-{} (mark {:#x})",
        config.queue.start,
        u32::from(config.queue.start) + u32::from(config.queue.threads) - 1,
        config.queue.mark
    );
    println!("  QUIC: {}", if config.quic.enabled { "enabled" } else { "disabled" });
    println!("  Target sets: {}", config.sets.len());
    for set in &config.sets {
        println!(
            "    {} ({} domains, {} networks, {})",
            set.name,
            set.domains.len(),
            set.cidrs.len(),
            set.evasion.fragmentation.strategy.name()
        );
    }
    Ok(())
}

/// nftables ruleset for a configuration
pub fn render_rules(config: &Config, table: &str) -> String {
    RuleBuilder::from_config(config).table(table).build()
}

/// Table of strategy families
pub fn render_families() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<18} {:<16} presets", "family", "tunable");
    for family in StrategyFamily::SURVEY {
        let tunable = match family.tunable() {
            Some(TunableParameter::FakeTtl) => "fake ttl",
            Some(TunableParameter::SplitPosition) => "split position",
            None => "-",
        };
        let _ = writeln!(
            out,
            "{:<18} {:<16} {}",
            family.name(),
            tunable,
            family.presets().len()
        );
    }
    out
}

fn show_paths() -> Result<()> {
    println!("Configuration file search paths:");
    println!();
    for (i, path) in search_paths().iter().enumerate() {
        let marker = if path.exists() { " (found)" } else { "" };
        println!("  {}. {}{}", i + 1, path.display(), marker);
    }
    Ok(())
}
