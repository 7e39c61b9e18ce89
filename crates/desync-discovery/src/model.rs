//! Probe outcomes, trial records and run progress

use desync_core::config::{EvasionConfig, StrategyFamily};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a probe did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Connection reset by a peer or an injected RST
    Reset,
    /// Nothing arrived before the deadline
    Timeout,
    /// The transfer started, then made no progress
    Stall,
    /// The TLS handshake ended in an alert
    TlsAlert,
    /// Redirected to a different host
    Redirect,
    /// A block page came back instead of content
    BlockPage,
    /// TCP connect was refused or unreachable
    ConnectFailed,
    /// Name resolution failed
    Dns,
    /// The trial configuration could not be applied
    Config,
    /// Anything else
    Other,
}

impl FailureMode {
    /// Short name
    pub fn as_str(self) -> &'static str {
        match self {
            FailureMode::Reset => "reset",
            FailureMode::Timeout => "timeout",
            FailureMode::Stall => "stall",
            FailureMode::TlsAlert => "tls_alert",
            FailureMode::Redirect => "redirect",
            FailureMode::BlockPage => "block_page",
            FailureMode::ConnectFailed => "connect_failed",
            FailureMode::Dns => "dns",
            FailureMode::Config => "config",
            FailureMode::Other => "other",
        }
    }

    /// Whether this failure looks like interference rather than an outage
    pub fn is_block_signal(self) -> bool {
        matches!(
            self,
            FailureMode::Reset
                | FailureMode::Timeout
                | FailureMode::Stall
                | FailureMode::TlsAlert
                | FailureMode::Redirect
                | FailureMode::BlockPage
        )
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one download probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    /// Time until completion or failure
    pub elapsed: Duration,
    /// Body bytes received
    pub bytes: u64,
    /// HTTP status, when a response head arrived
    pub http_status: Option<u16>,
    /// Set when the probe failed
    pub failure: Option<FailureMode>,
}

impl ProbeOutcome {
    /// A completed download
    pub fn success(bytes: u64, elapsed: Duration, http_status: u16) -> Self {
        Self {
            elapsed,
            bytes,
            http_status: Some(http_status),
            failure: None,
        }
    }

    /// A failed probe
    pub fn failure(mode: FailureMode, elapsed: Duration) -> Self {
        Self {
            elapsed,
            bytes: 0,
            http_status: None,
            failure: Some(mode),
        }
    }

    /// Attach the HTTP status seen before failing
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Whether the download completed
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Bytes per second; zero for failures
    pub fn throughput(&self) -> f64 {
        if !self.is_success() {
            return 0.0;
        }
        let secs = self.elapsed.as_secs_f64().max(0.001);
        self.bytes as f64 / secs
    }
}

/// Terminal state of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// The download completed
    Success,
    /// The download failed
    Failure,
    /// The run was canceled before the trial finished
    Canceled,
}

/// One tested configuration and how it fared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// Unique trial name within a run, e.g. `phase2/fake_sni/ttl=7`
    pub name: String,
    /// Family the configuration belongs to
    pub family: StrategyFamily,
    /// The evasion parameters tested
    pub evasion: EvasionConfig,
    /// Outcome
    pub status: TrialStatus,
    /// Probe duration in milliseconds
    pub elapsed_ms: u64,
    /// Body bytes received
    pub bytes: u64,
    /// Bytes per second
    pub throughput: f64,
    /// HTTP status, if one arrived
    pub http_status: Option<u16>,
    /// Failure classification
    pub failure: Option<FailureMode>,
}

impl TrialResult {
    /// Record a finished probe
    pub fn from_outcome(
        name: impl Into<String>,
        family: StrategyFamily,
        evasion: EvasionConfig,
        outcome: &ProbeOutcome,
    ) -> Self {
        Self {
            name: name.into(),
            family,
            evasion,
            status: if outcome.is_success() {
                TrialStatus::Success
            } else {
                TrialStatus::Failure
            },
            elapsed_ms: u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            bytes: outcome.bytes,
            throughput: outcome.throughput(),
            http_status: outcome.http_status,
            failure: outcome.failure,
        }
    }

    /// Record a trial interrupted by cancellation
    pub fn canceled(name: impl Into<String>, family: StrategyFamily, evasion: EvasionConfig) -> Self {
        Self {
            name: name.into(),
            family,
            evasion,
            status: TrialStatus::Canceled,
            elapsed_ms: 0,
            bytes: 0,
            throughput: 0.0,
            http_status: None,
            failure: None,
        }
    }

    /// Whether the download completed
    pub fn is_success(&self) -> bool {
        self.status == TrialStatus::Success
    }
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not started
    Pending,
    /// Characterizing the interference
    Fingerprint,
    /// Comparing resolvers
    DnsCheck,
    /// Baseline and one trial per family
    Survey,
    /// Bisecting numeric parameters
    Optimize,
    /// Pairing working families
    Combine,
    /// Restoring the configuration and picking the best
    Finalize,
    /// Finished
    Done,
}

impl Phase {
    /// Progress range covered by this phase, in percent
    pub fn span(self) -> (u8, u8) {
        match self {
            Phase::Pending => (0, 0),
            Phase::Fingerprint => (0, 15),
            Phase::DnsCheck => (15, 20),
            Phase::Survey => (20, 60),
            Phase::Optimize => (60, 85),
            Phase::Combine => (85, 95),
            Phase::Finalize => (95, 100),
            Phase::Done => (100, 100),
        }
    }

    /// Short name
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Fingerprint => "fingerprint",
            Phase::DnsCheck => "dns_check",
            Phase::Survey => "survey",
            Phase::Optimize => "optimize",
            Phase::Combine => "combine",
            Phase::Finalize => "finalize",
            Phase::Done => "done",
        }
    }
}

/// Snapshot of a run's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Current phase
    pub phase: Phase,
    /// Overall completion, 0-100
    pub percent: u8,
    /// Trials finished so far
    pub trials: usize,
    /// Latest human-readable step
    pub message: String,
}

impl Progress {
    /// Progress at `fraction` (0.0-1.0) of `phase`
    pub fn at(phase: Phase, fraction: f64, trials: usize, message: impl Into<String>) -> Self {
        let (lo, hi) = phase.span();
        let fraction = fraction.clamp(0.0, 1.0);
        let percent = f64::from(lo) + f64::from(hi - lo) * fraction;
        Self {
            phase,
            percent: percent.round() as u8,
            trials,
            message: message.into(),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::at(Phase::Pending, 0.0, 0, "queued")
    }
}
