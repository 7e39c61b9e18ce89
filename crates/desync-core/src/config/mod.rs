//! Configuration management for desync
//!
//! Provides a strongly-typed configuration system with TOML support,
//! per-family presets and an atomically swappable handle shared by the
//! packet workers and the discovery controller.

mod evasion;
mod handle;
mod preset;

pub use evasion::{
    DesyncConfig, DesyncMode, DnsBypassConfig, EvasionConfig, FakeConfig, FakePayloadKind,
    FragStrategy, FragmentationConfig, MutationConfig, SeqStrategy, ShuffleMode, TimingConfig,
};
pub use handle::{CompiledConfig, CompiledSet, ConfigHandle};
pub use preset::{StrategyFamily, TunableParameter};

use crate::conntrack::FlowLimits;
use crate::error::{Error, Result};
use crate::quic::ReassemblyLimits;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interception queue settings
    pub queue: QueueConfig,

    /// TCP flow tracking limits
    pub flow: FlowConfig,

    /// QUIC Initial handling
    pub quic: QuicConfig,

    /// Discovery controller tuning
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Target sets in priority order; the first match wins
    pub sets: Vec<TargetSetConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Configuration with a single catch-all set using a family preset
    pub fn from_family(family: StrategyFamily, domains: Vec<String>) -> Self {
        Self {
            sets: vec![TargetSetConfig {
                name: family.name().to_string(),
                domains,
                evasion: family.into_config(),
                ..TargetSetConfig::default()
            }],
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.threads == 0 {
            return Err(Error::config_value("queue.threads", "Must be at least 1"));
        }
        if u32::from(self.queue.start) + u32::from(self.queue.threads) > u32::from(u16::MAX) + 1 {
            return Err(Error::config_value(
                "queue",
                "Queue numbers start..start+threads exceed 65535",
            ));
        }
        if self.queue.mtu < 576 {
            return Err(Error::config_value("queue.mtu", "Must be at least 576"));
        }
        if self.flow.max_bytes < 64 {
            return Err(Error::config_value("flow.max_bytes", "Must be at least 64"));
        }
        if self.flow.max_flows == 0 {
            return Err(Error::config_value("flow.max_flows", "Must be at least 1"));
        }
        if self.quic.max_connections == 0 {
            return Err(Error::config_value("quic.max_connections", "Must be at least 1"));
        }
        self.discovery.validate()?;

        let mut names = std::collections::HashSet::new();
        for (i, set) in self.sets.iter().enumerate() {
            let prefix = format!("sets[{i}]");
            if set.name.trim().is_empty() {
                return Err(Error::config_value(format!("{prefix}.name"), "Must not be empty"));
            }
            if !names.insert(set.name.as_str()) {
                return Err(Error::config_value(
                    format!("{prefix}.name"),
                    format!("Duplicate set name '{}'", set.name),
                ));
            }
            set.evasion.validate(&prefix)?;
        }

        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Interception queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// First NFQUEUE number
    pub start: u16,
    /// Worker threads; queue numbers are `start..start+threads`
    pub threads: u16,
    /// Socket mark carried by injected packets so they are not re-queued
    pub mark: u32,
    /// Path MTU used when injecting oversized packets
    pub mtu: usize,
    /// Flow table sweep interval (milliseconds)
    pub sweep_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            start: 200,
            threads: 4,
            mark: 0x4000_0000,
            mtu: 1500,
            sweep_interval_ms: 2000,
        }
    }
}

impl QueueConfig {
    /// Queue numbers served by the worker pool
    pub fn queue_numbers(&self) -> impl Iterator<Item = u16> {
        let start = self.start;
        (0..self.threads).filter_map(move |i| start.checked_add(i))
    }

    /// Sweep interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// TCP flow tracking limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Payload bytes buffered per flow
    pub max_bytes: usize,
    /// Idle seconds before a flow is swept
    pub ttl_secs: u64,
    /// Flows tracked per worker
    pub max_flows: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        let limits = FlowLimits::default();
        Self {
            max_bytes: limits.max_bytes,
            ttl_secs: limits.ttl.as_secs(),
            max_flows: limits.max_flows,
        }
    }
}

impl FlowConfig {
    /// Limits for a [`crate::conntrack::FlowTracker`]
    pub fn limits(&self) -> FlowLimits {
        FlowLimits {
            max_bytes: self.max_bytes,
            ttl: Duration::from_secs(self.ttl_secs),
            max_flows: self.max_flows,
        }
    }
}

/// QUIC Initial handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    /// Inspect UDP/443
    pub enabled: bool,
    /// Remove Initial packet protection before reading frames
    pub decrypt: bool,
    /// Connections with buffered CRYPTO data per worker
    pub max_connections: usize,
    /// CRYPTO bytes kept per connection
    pub max_buffer: usize,
    /// Idle seconds before a buffer is swept
    pub idle_timeout_secs: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        let limits = ReassemblyLimits::default();
        Self {
            enabled: true,
            decrypt: true,
            max_connections: limits.max_connections,
            max_buffer: limits.max_buffer,
            idle_timeout_secs: limits.idle_timeout.as_secs(),
        }
    }
}

impl QuicConfig {
    /// Limits for a [`crate::quic::CryptoReassembler`]
    pub fn limits(&self) -> ReassemblyLimits {
        ReassemblyLimits {
            max_connections: self.max_connections,
            max_buffer: self.max_buffer,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Thresholds used to attribute blocking behaviour to a DPI type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintThresholds {
    /// A reset arriving faster than this is an in-path injector (ms)
    pub rst_fast_ms: u64,
    /// A reset slower than this is treated as coming from the far end (ms)
    pub rst_slow_ms: u64,
    /// Confidence below which recommendations fall back to the default order
    pub min_confidence: u8,
}

impl Default for FingerprintThresholds {
    fn default() -> Self {
        Self {
            rst_fast_ms: 15,
            rst_slow_ms: 150,
            min_confidence: 40,
        }
    }
}

/// Discovery controller tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Known-unblocked host used as a reachability and speed reference
    pub reference_domain: String,
    /// Path fetched for download trials
    pub probe_path: String,
    /// Overall timeout per probe (milliseconds)
    pub probe_timeout_ms: u64,
    /// A read without progress for this long fails the probe (milliseconds)
    pub stall_timeout_ms: u64,
    /// Wait after pushing a config before probing (milliseconds)
    pub propagation_delay_ms: u64,
    /// Bytes to read before a download counts as complete
    pub download_bytes: u64,
    /// DNS-over-HTTPS JSON endpoint
    pub doh_url: String,
    /// Lower bound of the fake TTL search
    pub ttl_min: u8,
    /// Upper bound of the fake TTL search
    pub ttl_max: u8,
    /// Upper bound of the split position search
    pub split_max: usize,
    /// Ordered family pairs tried in the combination phase
    pub max_combinations: usize,
    /// Resolver written into configs when DNS poisoning is detected
    pub bypass_resolver: SocketAddr,
    /// Fingerprint thresholds
    pub thresholds: FingerprintThresholds,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            reference_domain: "www.wikipedia.org".to_string(),
            probe_path: "/".to_string(),
            probe_timeout_ms: 10_000,
            stall_timeout_ms: 2_000,
            propagation_delay_ms: 250,
            download_bytes: 64 * 1024,
            doh_url: "https://cloudflare-dns.com/dns-query".to_string(),
            ttl_min: 1,
            ttl_max: 32,
            split_max: 64,
            max_combinations: 6,
            bypass_resolver: SocketAddr::from(([1, 1, 1, 1], 53)),
            thresholds: FingerprintThresholds::default(),
        }
    }
}

impl DiscoveryConfig {
    fn validate(&self) -> Result<()> {
        if self.ttl_min == 0 || self.ttl_min > self.ttl_max {
            return Err(Error::config_value(
                "discovery.ttl_min",
                "Must be 1 or more and not above ttl_max",
            ));
        }
        if self.split_max < 2 {
            return Err(Error::config_value("discovery.split_max", "Must be at least 2"));
        }
        if self.stall_timeout_ms == 0 || self.probe_timeout_ms < self.stall_timeout_ms {
            return Err(Error::config_value(
                "discovery.probe_timeout_ms",
                "Must be at least stall_timeout_ms, which must be non-zero",
            ));
        }
        if !self.doh_url.starts_with("https://") {
            return Err(Error::config_value("discovery.doh_url", "Must be an https:// URL"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (None = stdout only)
    pub file: Option<String>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}

/// A named group of targets and the evasion applied to them
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSetConfig {
    /// Set name
    pub name: String,
    /// Domains; each also covers its subdomains
    pub domains: Vec<String>,
    /// Files with one domain per line
    pub domain_files: Vec<PathBuf>,
    /// Networks in CIDR notation
    pub cidrs: Vec<String>,
    /// Evasion parameters
    pub evasion: EvasionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========== Default Config Tests ===========

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sets.is_empty());
        assert_eq!(config.queue.start, 200);
        assert_eq!(config.flow.max_bytes, 2048);
        assert!(config.quic.decrypt);
    }

    #[test]
    fn test_queue_numbers() {
        let queue = QueueConfig {
            start: 10,
            threads: 3,
            ..QueueConfig::default()
        };
        assert_eq!(queue.queue_numbers().collect::<Vec<_>>(), vec![10, 11, 12]);
    }

    #[test]
    fn test_flow_limits_conversion() {
        let limits = FlowConfig::default().limits();
        assert_eq!(limits.ttl, Duration::from_secs(5));
    }

    // =========== Validation Tests ===========

    #[test]
    fn test_config_validation() {
        let config = Config::from_family(StrategyFamily::TcpFrag, vec!["example.com".into()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_threads() {
        let mut config = Config::default();
        config.queue.threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_queue_overflow() {
        let mut config = Config::default();
        config.queue.start = u16::MAX;
        config.queue.threads = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_duplicate_set() {
        let mut config = Config::from_family(StrategyFamily::TcpFrag, vec![]);
        config.sets.push(config.sets[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_config_validation_ttl_window() {
        let mut config = Config::default();
        config.discovery.ttl_min = 10;
        config.discovery.ttl_max = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_reports_set_index() {
        let mut config = Config::from_family(StrategyFamily::FakeSni, vec![]);
        config.sets[0].evasion.fake.ttl = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sets[0].fake.ttl"));
    }

    // =========== TOML Serialization Tests ===========

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::from_family(StrategyFamily::Hybrid, vec!["example.com".into()]);
        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_toml_parse_minimal() {
        let toml_content = r#"
[queue]
start = 100
threads = 2

[[sets]]
name = "video"
domains = ["video.example"]
cidrs = ["203.0.113.0/24"]

[sets.evasion.fragmentation]
strategy = "disorder"
shuffle = "middle_random"
extra_positions = [3, 7]

[sets.evasion.fake]
enabled = true
ttl = 5
seq_strategy = "rand_seq"
"#;
        let config = Config::from_toml(toml_content).unwrap();
        assert_eq!(config.queue.start, 100);
        assert_eq!(config.queue.mark, QueueConfig::default().mark);
        let set = &config.sets[0];
        assert_eq!(set.name, "video");
        assert_eq!(set.evasion.fragmentation.strategy, FragStrategy::Disorder);
        assert_eq!(set.evasion.fragmentation.shuffle, ShuffleMode::MiddleRandom);
        assert_eq!(set.evasion.fake.seq_strategy, SeqStrategy::RandSeq);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parse_invalid() {
        let invalid_toml = "this is not [valid toml";
        assert!(Config::from_toml(invalid_toml).is_err());
    }

    #[test]
    fn test_toml_unknown_strategy() {
        let toml_content = r#"
[[sets]]
name = "x"
[sets.evasion.fragmentation]
strategy = "teleport"
"#;
        assert!(Config::from_toml(toml_content).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/desync.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }
}
