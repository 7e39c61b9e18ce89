//! Applying trial configurations
//!
//! The controller never talks to the packet workers directly. It publishes
//! a configuration through an [`Actuator`] and waits for the change to
//! propagate before probing.

use desync_core::config::{Config, ConfigHandle, EvasionConfig, TargetSetConfig};
use std::net::IpAddr;

/// Name of the target set discovery places in front of all others
pub const DISCOVERY_SET: &str = "discovery";

/// Something that can swap the active configuration
pub trait Actuator: Send + Sync {
    /// The configuration currently in force
    fn current(&self) -> Config;

    /// Validate and publish `config`, returning its generation
    fn apply(&self, config: Config) -> desync_core::Result<u64>;
}

impl Actuator for ConfigHandle {
    fn current(&self) -> Config {
        self.config()
    }

    fn apply(&self, config: Config) -> desync_core::Result<u64> {
        self.update(config)
    }
}

/// `base` with a leading set that sends `host` (and `addrs`) through `evasion`
///
/// Any earlier discovery set is replaced. Because the first matching set
/// wins, the trial set shadows whatever the operator configured for the
/// host.
pub fn trial_config(base: &Config, host: &str, addrs: &[IpAddr], evasion: EvasionConfig) -> Config {
    let mut config = base.clone();
    config.sets.retain(|set| set.name != DISCOVERY_SET);
    config.sets.insert(
        0,
        TargetSetConfig {
            name: DISCOVERY_SET.to_string(),
            domains: vec![host.to_string()],
            cidrs: addrs
                .iter()
                .map(|addr| match addr {
                    IpAddr::V4(v4) => format!("{v4}/32"),
                    IpAddr::V6(v6) => format!("{v6}/128"),
                })
                .collect(),
            evasion,
            ..TargetSetConfig::default()
        },
    );
    config
}
