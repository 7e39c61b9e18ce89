//! Discover command - search for a working configuration

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use desync_core::config::TargetSetConfig;
use desync_core::ConfigHandle;
use desync_discovery::{
    DiscoveryManager, DiscoveryReport, LiveNetwork, Network, Outcome, Phase, RunStatus,
    TrialStatus,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config;
use super::run::Engine;

/// Discover command arguments
#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// Hostname to find a working configuration for
    pub host: String,

    /// Write the full JSON report to this file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print the full JSON report instead of the summary
    #[arg(long)]
    pub json: bool,

    /// Stop after this many seconds and report what was found so far
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Domain known to be reachable, used as the speed reference
    #[arg(long, value_name = "HOST")]
    pub reference: Option<String>,

    /// DNS-over-HTTPS endpoint for the poisoning check
    #[arg(long, value_name = "URL")]
    pub doh_url: Option<String>,
}

/// Execute the discover command
pub fn execute(args: DiscoverArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = config::load_or_default(config_path)?;
    if let Some(ref reference) = args.reference {
        config.discovery.reference_domain = reference.clone();
    }
    if let Some(ref url) = args.doh_url {
        config.discovery.doh_url = url.clone();
    }
    config.validate().context("Configuration validation failed")?;

    let network = LiveNetwork::new(config.discovery.doh_url.clone())
        .context("Failed to build the probe client")?;
    let interrupt = super::interrupt_token()?;
    let engine = Engine::start(config)?;

    let watch = Watch {
        timeout: args.timeout.map(Duration::from_secs),
        interrupt,
        show_progress: !args.json,
    };
    let result = engine.runtime.block_on(discover(
        Arc::clone(&engine.handle),
        Arc::new(network),
        &args.host,
        &watch,
    ));
    let stats = engine.stop();
    debug!(stats = %stats, "interception stopped");
    let report = result?;

    if let Some(ref path) = args.output {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report)?;
    }
    Ok(())
}

/// How the foreground waits on a run
struct Watch {
    timeout: Option<Duration>,
    interrupt: CancellationToken,
    show_progress: bool,
}

async fn discover(
    handle: Arc<ConfigHandle>,
    network: Arc<dyn Network>,
    host: &str,
    watch: &Watch,
) -> Result<DiscoveryReport> {
    let manager = DiscoveryManager::new(network, handle, Handle::current());
    let id = manager.start(host)?;
    info!(%id, host, "discovery started");

    let deadline = async {
        match watch.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut shown: Option<(Phase, u8)> = None;
    let mut stopping = false;

    let status = loop {
        tokio::select! {
            status = manager.wait(id) => break status?,
            () = watch.interrupt.cancelled(), if !stopping => {
                warn!("interrupted, finishing the current trial");
                manager.cancel(id)?;
                stopping = true;
            }
            () = &mut deadline, if !stopping => {
                warn!("time limit reached, finishing the current trial");
                manager.cancel(id)?;
                stopping = true;
            }
            _ = ticker.tick() => {
                let progress = manager.progress(id)?;
                let key = (progress.phase, progress.percent);
                if watch.show_progress && shown != Some(key) {
                    eprintln!(
                        "{} {:>3}% {:<11} {}",
                        "»".cyan(),
                        progress.percent,
                        progress.phase.as_str(),
                        progress.message.dimmed()
                    );
                    shown = Some(key);
                }
            }
        }
    };

    match status {
        RunStatus::Failed => {
            let info = manager.info(id)?;
            bail!("Discovery failed: {}", info.error.unwrap_or_default())
        }
        _ => manager
            .results(id)?
            .context("Discovery ended without a report"),
    }
}

fn print_report(report: &DiscoveryReport) -> Result<()> {
    let headline = match report.outcome {
        Outcome::Found => "working configuration found".green().bold(),
        Outcome::Unblocked | Outcome::NoBypassNeeded => "no bypass needed".green(),
        Outcome::NotFound => "no working configuration".red().bold(),
        Outcome::Canceled => "canceled".yellow(),
    };
    println!();
    println!("{} {}", report.host.bold(), headline);
    print!("{}", render_summary(report));
    if let Some(snippet) = render_target_set(report)? {
        println!();
        println!("{}", "# Add to your configuration:".dimmed());
        print!("{snippet}");
    }
    Ok(())
}

/// Plain-text summary of a report
pub fn render_summary(report: &DiscoveryReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  outcome:     {}", report.outcome);
    if let Some(ref fp) = report.fingerprint {
        let _ = writeln!(
            out,
            "  dpi:         {} (confidence {}%)",
            fp.dpi_type.as_str(),
            fp.confidence
        );
        if let Some(hops) = fp.hop_distance {
            let _ = writeln!(out, "  hops:        {hops}");
        }
    }
    if let Some(ref dns) = report.dns {
        if dns.poisoned {
            let addr = dns
                .trial_addr
                .map_or_else(|| "-".to_string(), |a| a.to_string());
            let _ = writeln!(out, "  dns:         poisoned, probed {addr}");
        }
    }
    if let Some(ref best) = report.best {
        let _ = writeln!(
            out,
            "  best:        {} ({})",
            best.name,
            format_rate(best.throughput)
        );
        let _ = writeln!(out, "  improvement: {:+.1}%", report.improvement_pct);
    }
    let working = report.working().len();
    let _ = writeln!(
        out,
        "  trials:      {} run, {} working, {:.1}s",
        report.trials.len(),
        working,
        report.elapsed_ms as f64 / 1000.0
    );

    for trial in &report.trials {
        let status = match trial.status {
            TrialStatus::Success => "ok",
            TrialStatus::Failure => "fail",
            TrialStatus::Canceled => "canceled",
        };
        let detail = match (trial.status, trial.failure) {
            (TrialStatus::Success, _) => format_rate(trial.throughput),
            (_, Some(failure)) => failure.as_str().to_string(),
            _ => String::new(),
        };
        let _ = writeln!(
            out,
            "    {:<40} {:<8} {:>6}ms  {}",
            trial.name, status, trial.elapsed_ms, detail
        );
    }
    out
}

#[derive(Serialize)]
struct SetsSnippet {
    sets: Vec<TargetSetConfig>,
}

/// `[[sets]]` TOML applying the best configuration to the host
pub fn render_target_set(report: &DiscoveryReport) -> Result<Option<String>> {
    let Some(set) = report.target_set() else {
        return Ok(None);
    };
    let snippet = toml::to_string_pretty(&SetsSnippet { sets: vec![set] })
        .context("Failed to serialize the target set")?;
    Ok(Some(snippet))
}

fn format_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1024.0 * 1024.0 {
        format!("{:.1} MiB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else {
        format!("{:.1} KiB/s", bytes_per_sec / 1024.0)
    }
}
