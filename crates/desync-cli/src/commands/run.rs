//! Run command - main interception loop

use anyhow::{bail, Context, Result};
use clap::Args;
use desync_core::config::{Config, StrategyFamily};
use desync_core::{ConfigHandle, Stats};
use desync_platform::{PacketSink, RawSender, RuleBuilder, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config;

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Use a family preset for --domain instead of a configuration file
    #[arg(short, long)]
    pub family: Option<StrategyFamily>,

    /// Domain for the --family target set (repeatable)
    #[arg(short, long = "domain", value_name = "DOMAIN", requires = "family")]
    pub domains: Vec<String>,

    /// First NFQUEUE number
    #[arg(long, value_name = "NUM")]
    pub queue_start: Option<u16>,

    /// Worker threads, one queue each
    #[arg(long, value_name = "N")]
    pub threads: Option<u16>,

    /// Socket mark of injected packets
    #[arg(long, value_name = "MARK")]
    pub mark: Option<u32>,

    /// How often the configuration file is checked for changes
    #[arg(long, value_name = "MS", default_value = "1000")]
    pub reload_interval_ms: u64,

    /// Do not reload the configuration file when it changes
    #[arg(long)]
    pub no_reload: bool,

    /// Print the nftables rules for this configuration before starting
    #[arg(long)]
    pub print_rules: bool,

    /// Validate the configuration and print the rules, then exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute the run command
pub fn execute(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    let (config, source) = build_config(&args, config_path)?;
    info!(
        sets = config.sets.len(),
        queues = config.queue.threads,
        source = source.as_ref().map_or("preset".to_string(), |p| p.display().to_string()),
        "Loaded configuration"
    );

    if args.print_rules || args.dry_run {
        println!("{}", RuleBuilder::from_config(&config).build());
    }
    if args.dry_run {
        warn!("Dry run mode - no queues were bound");
        return Ok(());
    }

    let interrupt = super::interrupt_token()?;
    let engine = Engine::start(config)?;
    let mut reloader = if args.no_reload { None } else { source.map(Reloader::new) };
    let interval = Duration::from_millis(args.reload_interval_ms.max(100));

    let worker_lost = engine.runtime.block_on(async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = interrupt.cancelled() => {
                    info!("Shutting down");
                    return false;
                }
                _ = ticker.tick() => {
                    if engine.pool.any_finished() {
                        error!("A queue worker exited, shutting down");
                        return true;
                    }
                    if let Some(reloader) = reloader.as_mut() {
                        reloader.apply(&engine.handle);
                    }
                }
            }
        }
    });

    let stats = engine.stop();
    info!(stats = %stats, "desync stopped");
    if worker_lost {
        bail!("A queue worker stopped unexpectedly");
    }
    Ok(())
}

/// Configuration from a family preset or the configuration file, with
/// command-line overrides applied; the path is returned for reloading
fn build_config(args: &RunArgs, config_path: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    let (mut config, source) = match args.family {
        Some(family) => {
            if args.domains.is_empty() {
                bail!("--family needs at least one --domain");
            }
            (Config::from_family(family, args.domains.clone()), None)
        }
        None => {
            let path = config::resolve_path(config_path).context(
                "No configuration file found; pass --config, or --family with --domain",
            )?;
            (config::load(&path)?, Some(path))
        }
    };

    if let Some(start) = args.queue_start {
        config.queue.start = start;
    }
    if let Some(threads) = args.threads {
        config.queue.threads = threads;
    }
    if let Some(mark) = args.mark {
        config.queue.mark = mark;
    }
    config.validate().context("Configuration validation failed")?;
    Ok((config, source))
}

/// Worker pool, raw sender and the runtime dispatching send plans
pub(crate) struct Engine {
    pub runtime: Runtime,
    pub handle: Arc<ConfigHandle>,
    pool: WorkerPool,
}

impl Engine {
    /// Open the raw sockets and bind every configured queue
    pub fn start(config: Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("desync-rt")
            .build()
            .context("Failed to start the async runtime")?;
        let mark = config.queue.mark;
        let handle = Arc::new(ConfigHandle::new(config).context("Configuration rejected")?);
        let sender = RawSender::open(mark)
            .context("Failed to open raw sockets - run as root or grant CAP_NET_RAW")?;
        let pool = start_pool(Arc::clone(&handle), Arc::new(sender), &runtime)?;
        info!(workers = pool.len(), "Packet interception started");
        Ok(Self {
            runtime,
            handle,
            pool,
        })
    }

    /// Stop the workers, then let pending send plans drain
    pub fn stop(self) -> Stats {
        let stats = self.pool.stop();
        self.runtime.shutdown_timeout(Duration::from_secs(1));
        stats
    }
}

#[cfg(target_os = "linux")]
fn start_pool(handle: Arc<ConfigHandle>, sink: Arc<dyn PacketSink>, runtime: &Runtime) -> Result<WorkerPool> {
    WorkerPool::start(handle, sink, runtime.handle().clone(), CancellationToken::new())
        .context("Failed to bind NFQUEUE - are the rules from `desync config rules` installed?")
}

#[cfg(not(target_os = "linux"))]
fn start_pool(_: Arc<ConfigHandle>, _: Arc<dyn PacketSink>, _: &Runtime) -> Result<WorkerPool> {
    bail!("Packet interception requires Linux NFQUEUE")
}

/// Reloads the configuration file when its modification time changes
#[derive(Debug)]
pub(crate) struct Reloader {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl Reloader {
    pub fn new(path: PathBuf) -> Self {
        let modified = modified_time(&path);
        Self { path, modified }
    }

    /// The file again, if it changed since the last look
    pub fn poll(&mut self) -> Option<Result<Config>> {
        let modified = modified_time(&self.path)?;
        if self.modified == Some(modified) {
            return None;
        }
        self.modified = Some(modified);
        Some(config::load(&self.path))
    }

    /// Publish a changed file; a bad file leaves the active configuration
    /// in place. Returns the new generation.
    pub fn apply(&mut self, handle: &ConfigHandle) -> Option<u64> {
        let path = self.path.display().to_string();
        match self.poll()? {
            Ok(config) => match handle.update(config) {
                Ok(generation) => {
                    info!(%path, generation, "Configuration reloaded");
                    Some(generation)
                }
                Err(e) => {
                    warn!(%path, error = %e, "Reloaded configuration rejected, keeping the active one");
                    None
                }
            },
            Err(e) => {
                warn!(%path, error = format!("{e:#}"), "Configuration reload failed, keeping the active one");
                None
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs::File;

    fn run_args(argv: &[&str]) -> RunArgs {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            run: RunArgs,
        }
        let mut full = vec!["run"];
        full.extend_from_slice(argv);
        Wrapper::parse_from(full).run
    }

    fn write_config(path: &Path, family: StrategyFamily, domain: &str) {
        let config = Config::from_family(family, vec![domain.to_string()]);
        std::fs::write(path, config.to_toml().unwrap()).unwrap();
    }

    fn touch_later(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    // ============ Config Building Tests ============

    #[test]
    fn test_family_preset_config() {
        let args = run_args(&["--family", "disorder", "-d", "blocked.example", "--threads", "2"]);
        let (config, source) = build_config(&args, None).unwrap();
        assert!(source.is_none());
        assert_eq!(config.queue.threads, 2);
        assert_eq!(config.sets[0].domains, vec!["blocked.example".to_string()]);
        assert_eq!(config.sets[0].evasion, StrategyFamily::Disorder.into_config());
    }

    #[test]
    fn test_family_without_domain_rejected() {
        let args = run_args(&["--family", "tcp_frag"]);
        assert!(build_config(&args, None).is_err());
    }

    #[test]
    fn test_domain_requires_family() {
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            _run: RunArgs,
        }
        assert!(Wrapper::try_parse_from(["run", "-d", "blocked.example"]).is_err());
    }

    #[test]
    fn test_file_config_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desync.toml");
        write_config(&path, StrategyFamily::FakeSni, "blocked.example");

        let args = run_args(&["--queue-start", "42", "--mark", "256"]);
        let (config, source) = build_config(&args, Some(&path)).unwrap();
        assert_eq!(source, Some(path));
        assert_eq!(config.queue.start, 42);
        assert_eq!(config.queue.mark, 256);
        assert_eq!(config.sets[0].name, "fake_sni");
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = run_args(&["--family", "tcp_frag", "-d", "a.example", "--threads", "0"]);
        assert!(build_config(&args, None).is_err());
    }

    // ============ Reload Tests ============

    #[test]
    fn test_reloader_ignores_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desync.toml");
        write_config(&path, StrategyFamily::TcpFrag, "a.example");

        let mut reloader = Reloader::new(path);
        assert!(reloader.poll().is_none());
        assert!(reloader.poll().is_none());
    }

    #[test]
    fn test_reloader_publishes_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desync.toml");
        write_config(&path, StrategyFamily::TcpFrag, "a.example");

        let handle = ConfigHandle::new(config::load(&path).unwrap()).unwrap();
        let mut reloader = Reloader::new(path.clone());

        write_config(&path, StrategyFamily::FakeSni, "b.example");
        touch_later(&path, 10);

        let generation = reloader.apply(&handle).unwrap();
        assert_eq!(handle.generation(), generation);
        assert!(handle.load().match_host("b.example").is_some());
        assert!(handle.load().match_host("a.example").is_none());
        assert!(reloader.apply(&handle).is_none());
    }

    #[test]
    fn test_reloader_keeps_active_config_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desync.toml");
        write_config(&path, StrategyFamily::TcpFrag, "a.example");

        let handle = ConfigHandle::new(config::load(&path).unwrap()).unwrap();
        let mut reloader = Reloader::new(path.clone());

        std::fs::write(&path, "[queue]\nthreads = 0\n").unwrap();
        touch_later(&path, 10);

        assert!(reloader.apply(&handle).is_none());
        assert_eq!(handle.generation(), 0);
        assert!(handle.load().match_host("a.example").is_some());
    }

    #[test]
    fn test_reloader_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desync.toml");
        write_config(&path, StrategyFamily::TcpFrag, "a.example");

        let mut reloader = Reloader::new(path.clone());
        std::fs::remove_file(&path).unwrap();
        assert!(reloader.poll().is_none());
    }
}
