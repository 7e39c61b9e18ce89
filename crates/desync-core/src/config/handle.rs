//! Hot-swappable configuration
//!
//! Workers load one [`CompiledConfig`] snapshot per packet. An update is
//! validated and compiled before it is published, so a rejected document
//! leaves the running configuration untouched and a reader never sees a
//! half-applied change.

use super::{Config, EvasionConfig};
use crate::error::Result;
use crate::filter::{TargetMatcher, TargetSet};
use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// One target set ready for the packet path
#[derive(Debug, Clone)]
pub struct CompiledSet {
    /// Set name
    pub name: String,
    /// Evasion parameters
    pub evasion: EvasionConfig,
    /// Decoded custom fake payload
    pub custom_fake: Option<Vec<u8>>,
}

/// A validated configuration with its matcher built
#[derive(Debug)]
pub struct CompiledConfig {
    /// Source document
    pub config: Config,
    /// Hostname and CIDR matcher, one entry per set
    pub matcher: TargetMatcher,
    /// Sets, same order as the matcher
    pub sets: Vec<CompiledSet>,
    /// Monotonic publish counter
    pub generation: u64,
}

impl CompiledConfig {
    /// Validate and compile a configuration document
    pub fn compile(config: Config, generation: u64) -> Result<Self> {
        config.validate()?;

        let mut target_sets = Vec::with_capacity(config.sets.len());
        let mut sets = Vec::with_capacity(config.sets.len());
        for set in &config.sets {
            let mut targets = TargetSet::new(&set.name);
            for domain in &set.domains {
                targets.add_domain(domain);
            }
            for path in &set.domain_files {
                targets.load_domains_file(path)?;
            }
            for cidr in &set.cidrs {
                targets.add_cidr(cidr)?;
            }
            target_sets.push(targets);
            sets.push(CompiledSet {
                name: set.name.clone(),
                custom_fake: set.evasion.custom_fake_payload()?,
                evasion: set.evasion.clone(),
            });
        }

        Ok(Self {
            matcher: TargetMatcher::new(target_sets),
            sets,
            config,
            generation,
        })
    }

    /// First set whose domains cover `host`
    pub fn match_host(&self, host: &str) -> Option<&CompiledSet> {
        self.matcher.match_host(host).and_then(|i| self.sets.get(i))
    }

    /// First set whose networks contain `ip`
    pub fn match_ip(&self, ip: IpAddr) -> Option<&CompiledSet> {
        self.matcher.match_ip(ip).and_then(|i| self.sets.get(i))
    }

    /// Whether redirected DNS responses may arrive from `ip`
    pub fn is_dns_resolver(&self, ip: IpAddr, port: u16) -> bool {
        self.sets.iter().any(|s| {
            s.evasion.dns.enabled && s.evasion.dns.resolver == Some(ip) && s.evasion.dns.port == port
        })
    }

    /// Whether any set redirects DNS
    pub fn dns_bypass_enabled(&self) -> bool {
        self.sets.iter().any(|s| s.evasion.dns.enabled)
    }
}

/// Shared, atomically swappable configuration
#[derive(Debug)]
pub struct ConfigHandle {
    current: ArcSwap<CompiledConfig>,
    generation: AtomicU64,
}

impl ConfigHandle {
    /// Compile `config` and wrap it
    pub fn new(config: Config) -> Result<Self> {
        let compiled = CompiledConfig::compile(config, 0)?;
        Ok(Self {
            current: ArcSwap::from_pointee(compiled),
            generation: AtomicU64::new(0),
        })
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<CompiledConfig> {
        self.current.load_full()
    }

    /// Copy of the current configuration document
    pub fn config(&self) -> Config {
        self.current.load().config.clone()
    }

    /// Validate, compile and publish a new configuration. On error the
    /// previous configuration stays active. Returns the new generation.
    pub fn update(&self, config: Config) -> Result<u64> {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        let compiled = CompiledConfig::compile(config, generation)?;
        self.current.store(Arc::new(compiled));
        self.generation.store(generation, Ordering::Release);
        info!(generation, "configuration published");
        Ok(generation)
    }

    /// Generation of the active configuration
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
