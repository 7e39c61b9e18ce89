//! Interference fingerprinting
//!
//! A short probe battery is run against the target, then weighted rules
//! turn the evidence into scores over a handful of DPI hypotheses. The
//! winner's confidence decides whether its family ranking is trusted or the
//! plain survey order is used.

use crate::model::{FailureMode, ProbeOutcome};
use crate::network::{HelloOutcome, HelloRequest, HttpOutcome, Network, ProbeRequest};
use crate::search::Bisection;
use desync_core::config::{DiscoveryConfig, FingerprintThresholds, StrategyFamily};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Kind of middlebox the evidence points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DpiType {
    /// No interference observed
    None,
    /// Off-path box racing the server with injected resets
    PassiveInjector,
    /// In-path box holding per-flow state and dropping or resetting
    StatefulInline,
    /// Proxy terminating or answering connections itself
    TransparentProxy,
    /// Traffic to the target silently discarded
    Blackhole,
    /// Evidence inconclusive
    Unknown,
}

impl DpiType {
    /// Short name
    pub fn as_str(self) -> &'static str {
        match self {
            DpiType::None => "none",
            DpiType::PassiveInjector => "passive_injector",
            DpiType::StatefulInline => "stateful_inline",
            DpiType::TransparentProxy => "transparent_proxy",
            DpiType::Blackhole => "blackhole",
            DpiType::Unknown => "unknown",
        }
    }

    /// Families to try first against this kind of box
    pub fn recommended(self) -> &'static [StrategyFamily] {
        use StrategyFamily as F;
        match self {
            DpiType::None => &[],
            DpiType::PassiveInjector => &[F::FakeSni, F::Desync, F::Hybrid, F::SynFake, F::TcpFrag],
            DpiType::StatefulInline => {
                &[F::TcpFrag, F::TlsRecordSplit, F::Disorder, F::IpFrag, F::Hybrid]
            }
            DpiType::TransparentProxy => {
                &[F::TlsRecordSplit, F::SniMutation, F::ExtensionSplit, F::TcpFrag]
            }
            DpiType::Blackhole => &[F::IpFrag, F::TcpFrag, F::Combo, F::Overlap],
            DpiType::Unknown => &StrategyFamily::SURVEY,
        }
    }
}

/// Raw probe results
#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    /// Download of the reference domain
    pub reference: ProbeOutcome,
    /// Download of the target as the system resolves it
    pub target: ProbeOutcome,
    /// ClientHello carrying the target's SNI
    pub hello_sni: HelloOutcome,
    /// ClientHello without SNI
    pub hello_plain: HelloOutcome,
    /// Plain HTTP with the target's Host header
    pub http: HttpOutcome,
    /// Whether UDP 443 answered
    pub quic: bool,
    /// Hops to the box sending resets
    pub hops: Option<u8>,
}

/// Scored fingerprint of the path to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Winning hypothesis
    pub dpi_type: DpiType,
    /// Share of the total score held by the winner, 0-100
    pub confidence: u8,
    /// Score per hypothesis
    pub scores: BTreeMap<DpiType, u32>,
    /// Families in the order they should be tried
    pub recommended: Vec<StrategyFamily>,
    /// Whether the reference domain downloaded
    pub reference_ok: bool,
    /// Reference download speed, bytes per second
    pub reference_throughput: f64,
    /// Whether the target downloaded without help
    pub target_ok: bool,
    /// How the target download failed
    pub target_failure: Option<FailureMode>,
    /// Milliseconds until the reset, when one arrived
    pub rst_latency_ms: Option<u64>,
    /// Omitting SNI made the handshake succeed
    pub sni_filtering: bool,
    /// The HTTP Host test was redirected, blocked or reset
    pub http_blocked: bool,
    /// UDP 443 answered
    pub quic_reachable: bool,
    /// Hops to the resetting box
    pub hop_distance: Option<u8>,
}

impl Fingerprint {
    /// TTL hint for fake and desync packets
    pub fn ttl_hint(&self) -> Option<u8> {
        self.hop_distance
    }

    /// Whether anything looked like interference
    pub fn blocked(&self) -> bool {
        !self.target_ok || self.sni_filtering || self.http_blocked
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Hop count implied by an observed TTL, assuming a common initial value
pub fn hops_from_ttl(observed: u8) -> u8 {
    let initial: u8 = match observed {
        0..=64 => 64,
        65..=128 => 128,
        _ => 255,
    };
    initial - observed
}

/// Weigh the evidence
pub fn score(evidence: &Evidence, thresholds: &FingerprintThresholds) -> Fingerprint {
    let mut scores: BTreeMap<DpiType, u32> = BTreeMap::new();
    let mut add = |kind: DpiType, points: u32| *scores.entry(kind).or_default() += points;

    let mut rst_latency_ms = None;
    match evidence.hello_sni {
        HelloOutcome::Response { .. } if evidence.target.is_success() => add(DpiType::None, 100),
        HelloOutcome::Response { .. } => add(DpiType::TransparentProxy, 20),
        HelloOutcome::Reset { after, .. } => {
            let ms = millis(after);
            rst_latency_ms = Some(ms);
            if ms < thresholds.rst_fast_ms {
                add(DpiType::PassiveInjector, 40);
            } else if ms > thresholds.rst_slow_ms {
                add(DpiType::StatefulInline, 30);
            } else {
                add(DpiType::StatefulInline, 25);
                add(DpiType::PassiveInjector, 15);
            }
        }
        HelloOutcome::Timeout => {
            add(DpiType::Blackhole, 35);
            add(DpiType::StatefulInline, 15);
        }
        HelloOutcome::Closed => add(DpiType::TransparentProxy, 15),
        HelloOutcome::Unreachable => add(DpiType::Blackhole, 20),
    }

    let sni_filtering = evidence.hello_plain.answered() && !evidence.hello_sni.answered();
    if sni_filtering {
        add(DpiType::StatefulInline, 20);
        add(DpiType::PassiveInjector, 10);
    } else if !evidence.hello_plain.answered() && !evidence.hello_sni.answered() {
        add(DpiType::Blackhole, 25);
    }

    match evidence.target.failure {
        None => {}
        Some(FailureMode::Reset) => add(DpiType::PassiveInjector, 20),
        Some(FailureMode::Timeout | FailureMode::Stall) => {
            add(DpiType::Blackhole, 15);
            add(DpiType::StatefulInline, 10);
        }
        Some(FailureMode::Redirect | FailureMode::BlockPage) => add(DpiType::TransparentProxy, 40),
        Some(FailureMode::TlsAlert) => {
            add(DpiType::TransparentProxy, 20);
            add(DpiType::StatefulInline, 20);
        }
        Some(_) => add(DpiType::Unknown, 10),
    }

    let http_blocked = match &evidence.http {
        HttpOutcome::Status { code, location } => {
            let blocked =
                matches!(*code, 403 | 451) || ((300..400).contains(code) && location.is_some());
            if blocked {
                add(DpiType::TransparentProxy, 25);
            }
            blocked
        }
        HttpOutcome::Reset => {
            add(DpiType::PassiveInjector, 10);
            true
        }
        HttpOutcome::Timeout | HttpOutcome::Unreachable => false,
    };

    if !evidence.quic && evidence.reference.is_success() {
        add(DpiType::Blackhole, 5);
    }
    if !evidence.reference.is_success() {
        add(DpiType::Unknown, 30);
    }

    let total: u32 = scores.values().sum();
    let (dpi_type, top) = scores
        .iter()
        .max_by_key(|(_, points)| **points)
        .map_or((DpiType::Unknown, 0), |(kind, points)| (*kind, *points));
    let confidence = if total == 0 {
        0
    } else {
        u8::try_from(top * 100 / total).unwrap_or(100)
    };

    let recommended = if confidence < thresholds.min_confidence {
        StrategyFamily::SURVEY.to_vec()
    } else {
        dpi_type.recommended().to_vec()
    };

    Fingerprint {
        dpi_type,
        confidence,
        scores,
        recommended,
        reference_ok: evidence.reference.is_success(),
        reference_throughput: evidence.reference.throughput(),
        target_ok: evidence.target.is_success(),
        target_failure: evidence.target.failure,
        rst_latency_ms,
        sni_filtering,
        http_blocked,
        quic_reachable: evidence.quic,
        hop_distance: evidence.hops,
    }
}

/// Smallest TTL at which a ClientHello still draws a reset
async fn estimate_hops(
    network: &dyn Network,
    addr: IpAddr,
    host: &str,
    settings: &DiscoveryConfig,
) -> Option<u8> {
    let probe = |ttl: u8| HelloRequest {
        addr,
        sni: Some(host.to_string()),
        ttl: Some(ttl),
        timeout: Duration::from_millis(settings.stall_timeout_ms),
    };
    let resets = |outcome: HelloOutcome| matches!(outcome, HelloOutcome::Reset { .. });

    if !resets(network.hello(&probe(settings.ttl_max)).await) {
        return None;
    }
    let mut search = Bisection::new(
        usize::from(settings.ttl_max),
        usize::from(settings.ttl_min) - 1,
    );
    while let Some(ttl) = search.next() {
        let ttl = u8::try_from(ttl).unwrap_or(u8::MAX);
        search.record(usize::from(ttl), resets(network.hello(&probe(ttl)).await));
    }
    u8::try_from(search.boundary()).ok()
}

/// Run the probe battery against `host` at `addr`
pub async fn fingerprint(
    network: &dyn Network,
    host: &str,
    addr: Option<IpAddr>,
    settings: &DiscoveryConfig,
) -> Fingerprint {
    let timeout = Duration::from_millis(settings.probe_timeout_ms);
    let download = |host: &str| ProbeRequest {
        host: host.to_string(),
        addr: None,
        path: settings.probe_path.clone(),
        timeout,
        stall_timeout: Duration::from_millis(settings.stall_timeout_ms),
        max_bytes: settings.download_bytes,
    };

    let reference = network.download(&download(&settings.reference_domain)).await;
    let target = network.download(&download(host)).await;

    let Some(addr) = addr else {
        let evidence = Evidence {
            reference,
            target,
            hello_sni: HelloOutcome::Unreachable,
            hello_plain: HelloOutcome::Unreachable,
            http: HttpOutcome::Unreachable,
            quic: false,
            hops: None,
        };
        return score(&evidence, &settings.thresholds);
    };

    let hello = |sni: Option<String>| HelloRequest {
        addr,
        sni,
        ttl: None,
        timeout,
    };
    let hello_sni = network.hello(&hello(Some(host.to_string()))).await;
    let hello_plain = network.hello(&hello(None)).await;
    let http = network.http_host(addr, host, timeout).await;
    let quic = network
        .quic(SocketAddr::new(addr, 443), Duration::from_millis(settings.stall_timeout_ms))
        .await;

    let hops = match hello_sni {
        HelloOutcome::Reset { ttl: Some(ttl), .. } => Some(hops_from_ttl(ttl)),
        HelloOutcome::Reset { ttl: None, .. } => estimate_hops(network, addr, host, settings).await,
        _ => None,
    };

    let evidence = Evidence {
        reference,
        target,
        hello_sni,
        hello_plain,
        http,
        quic,
        hops,
    };
    let print = score(&evidence, &settings.thresholds);
    debug!(
        host,
        dpi = ?print.dpi_type,
        confidence = print.confidence,
        hops = ?print.hop_distance,
        "fingerprint"
    );
    print
}
