//! Final discovery report

use crate::fingerprint::Fingerprint;
use crate::model::TrialResult;
use desync_core::config::TargetSetConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The target was reachable and DNS was clean; nothing was tried
    Unblocked,
    /// The no-bypass trial already worked
    NoBypassNeeded,
    /// At least one strategy worked
    Found,
    /// Every strategy failed
    NotFound,
    /// Canceled before anything worked
    Canceled,
}

impl Outcome {
    /// Short name
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Unblocked => "unblocked",
            Outcome::NoBypassNeeded => "no_bypass_needed",
            Outcome::Found => "found",
            Outcome::NotFound => "not_found",
            Outcome::Canceled => "canceled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolver comparison
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DnsReport {
    /// Addresses from the system resolver
    pub system: Vec<IpAddr>,
    /// Addresses from DNS-over-HTTPS
    pub doh: Vec<IpAddr>,
    /// The system answer does not serve the target
    pub poisoned: bool,
    /// Address the trials connected to
    pub trial_addr: Option<IpAddr>,
}

/// Percentage gain of `best` over the baseline
///
/// The baseline is the measured no-bypass speed when that trial completed,
/// otherwise the reference domain's speed. Without either the gain is 0.
pub fn improvement_pct(best: f64, baseline: Option<f64>, reference: Option<f64>) -> f64 {
    let base = baseline
        .filter(|b| *b > 0.0)
        .or_else(|| reference.filter(|r| *r > 0.0));
    match base {
        Some(base) => (best - base) / base * 100.0,
        None => 0.0,
    }
}

/// Everything a run learned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Target hostname
    pub host: String,
    /// How the run ended
    pub outcome: Outcome,
    /// Fingerprint, unless canceled first
    pub fingerprint: Option<Fingerprint>,
    /// Resolver comparison
    pub dns: Option<DnsReport>,
    /// The no-bypass trial
    pub baseline: Option<TrialResult>,
    /// Reference domain speed, bytes per second
    pub reference_throughput: Option<f64>,
    /// Fastest working configuration
    pub best: Option<TrialResult>,
    /// Gain of `best` over the baseline, in percent
    pub improvement_pct: f64,
    /// Every trial, in execution order
    pub trials: Vec<TrialResult>,
    /// The run was canceled
    pub canceled: bool,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

impl DiscoveryReport {
    /// Successful trials, fastest first
    pub fn working(&self) -> Vec<&TrialResult> {
        let mut working: Vec<_> = self.trials.iter().filter(|t| t.is_success()).collect();
        working.sort_by(|a, b| b.throughput.total_cmp(&a.throughput));
        working
    }

    /// Target set applying the best configuration to the host
    pub fn target_set(&self) -> Option<TargetSetConfig> {
        self.best.as_ref().map(|best| TargetSetConfig {
            name: self.host.clone(),
            domains: vec![self.host.clone()],
            evasion: best.evasion.clone(),
            ..TargetSetConfig::default()
        })
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improvement_prefers_baseline() {
        assert!((improvement_pct(200.0, Some(100.0), Some(400.0)) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_improvement_falls_back_to_reference() {
        assert!((improvement_pct(50.0, None, Some(100.0)) + 50.0).abs() < 1e-9);
        assert!((improvement_pct(150.0, Some(0.0), Some(100.0)) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_improvement_without_base() {
        assert_eq!(improvement_pct(1_000.0, None, None), 0.0);
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(Outcome::NoBypassNeeded.to_string(), "no_bypass_needed");
        assert_eq!(
            serde_json::to_string(&Outcome::NotFound).unwrap(),
            "\"not_found\""
        );
    }
}
