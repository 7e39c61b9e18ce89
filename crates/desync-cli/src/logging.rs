//! Logging initialization

use anyhow::{Context, Result};
use desync_core::config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::args::{Args, LogFormat};

/// Effective logging settings after merging flags over the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    pub verbose: u8,
}

impl LogSettings {
    /// Flags win; the `[logging]` section fills the rest
    pub fn resolve(args: &Args, config: &LoggingConfig) -> Self {
        let level = if args.quiet {
            Level::ERROR
        } else {
            match args.verbose {
                0 => config.level.parse().unwrap_or(Level::INFO),
                1 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };
        let format = args.log_format.unwrap_or(if config.json_format {
            LogFormat::Json
        } else {
            LogFormat::Text
        });
        let file = args
            .log_file
            .clone()
            .or_else(|| config.file.as_ref().map(PathBuf::from));
        Self {
            level,
            format,
            file,
            verbose: args.verbose,
        }
    }
}

/// Install the global subscriber
///
/// Console output goes to stderr so command output on stdout stays clean.
/// The returned guard flushes the log file and must outlive the program.
pub fn init(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(settings.level.into())
        .from_env_lossy();

    let verbose = settings.verbose;
    let console = match settings.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose >= 2)
            .with_thread_ids(verbose >= 3)
            .with_file(verbose >= 3)
            .with_line_number(verbose >= 3)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match settings.file {
        Some(ref path) => {
            let (dir, name) = split_log_path(path)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = match settings.format {
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
                _ => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;

    Ok(guard)
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["desync"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["config", "families"]);
        Args::parse_from(argv)
    }

    #[test]
    fn test_config_level_used_without_flags() {
        let config = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };
        let settings = LogSettings::resolve(&args(&[]), &config);
        assert_eq!(settings.level, Level::WARN);
        assert_eq!(settings.format, LogFormat::Text);
        assert_eq!(settings.file, None);
    }

    #[test]
    fn test_flags_override_config() {
        let config = LoggingConfig {
            level: "warn".into(),
            file: Some("/var/log/desync.log".into()),
            json_format: true,
        };
        let settings = LogSettings::resolve(
            &args(&["-vv", "--log-format", "compact", "--log-file", "out.log"]),
            &config,
        );
        assert_eq!(settings.level, Level::TRACE);
        assert_eq!(settings.format, LogFormat::Compact);
        assert_eq!(settings.file, Some(PathBuf::from("out.log")));
    }

    #[test]
    fn test_json_and_file_from_config() {
        let config = LoggingConfig {
            file: Some("/var/log/desync.log".into()),
            json_format: true,
            ..LoggingConfig::default()
        };
        let settings = LogSettings::resolve(&args(&[]), &config);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.file, Some(PathBuf::from("/var/log/desync.log")));
    }

    #[test]
    fn test_quiet_and_bad_level() {
        let config = LoggingConfig {
            level: "loud".into(),
            ..LoggingConfig::default()
        };
        assert_eq!(LogSettings::resolve(&args(&[]), &config).level, Level::INFO);
        assert_eq!(LogSettings::resolve(&args(&["-q"]), &config).level, Level::ERROR);
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/desync.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log"));
        assert_eq!(name, PathBuf::from("desync.log"));

        let (dir, _) = split_log_path(Path::new("desync.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));

        assert!(split_log_path(Path::new("/")).is_err());
    }
}
