//! Discovery state machine
//!
//! `Fingerprint → DnsCheck → Survey → Optimize → Combine → Finalize`, with
//! two early exits: a target that is not blocked at all, and a no-bypass
//! trial that already works. Each trial publishes a configuration through
//! the [`Actuator`], waits for it to propagate, then runs one download.
//!
//! Cancellation is observed before every trial and during every probe. A
//! canceled run still restores the original configuration and produces a
//! report with whatever was learned.

use crate::actuator::{trial_config, Actuator};
use crate::error::{validate_host, Result};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::model::{FailureMode, Phase, ProbeOutcome, Progress, TrialResult, TrialStatus};
use crate::network::{HelloRequest, Network, ProbeRequest};
use crate::report::{improvement_pct, DiscoveryReport, DnsReport, Outcome};
use crate::search::{
    combine, family_order, position_of, ttl_of, with_dns_bypass, with_payload, with_position,
    with_ttl, Bisection,
};
use desync_core::config::{
    Config, DiscoveryConfig, EvasionConfig, FakePayloadKind, StrategyFamily, TunableParameter,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Families combined in the last phase
const COMBINE_TOP: usize = 4;

/// Runs discovery for one host at a time
pub struct Controller {
    network: Arc<dyn Network>,
    actuator: Arc<dyn Actuator>,
    cancel: CancellationToken,
    progress: Option<watch::Sender<Progress>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("canceled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Controller probing through `network` and applying trials through
    /// `actuator`
    pub fn new(network: Arc<dyn Network>, actuator: Arc<dyn Actuator>) -> Self {
        Self {
            network,
            actuator,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Stop at the next safe point once `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Publish progress on `sender`
    pub fn with_progress(mut self, sender: watch::Sender<Progress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Discover a working configuration for `host`
    ///
    /// The active configuration is the same before and after the call.
    ///
    /// # Errors
    /// Only an invalid hostname is an error; probe failures end up in the
    /// report.
    pub async fn run(&self, host: &str) -> Result<DiscoveryReport> {
        let host = validate_host(host)?;
        let original = self.actuator.current();
        let mut run = Run::new(self, host, original);
        run.execute().await;
        Ok(run.finish())
    }
}

/// State of one run
struct Run<'a> {
    ctl: &'a Controller,
    host: String,
    original: Config,
    settings: DiscoveryConfig,
    started: Instant,
    phase: Phase,
    fraction: f64,
    addrs: Vec<IpAddr>,
    dns_bypass: Option<SocketAddr>,
    payload: FakePayloadKind,
    fingerprint: Option<Fingerprint>,
    dns: Option<DnsReport>,
    baseline: Option<TrialResult>,
    trials: Vec<TrialResult>,
    /// Best trial per working family
    working: Vec<TrialResult>,
    combined: Vec<TrialResult>,
    outcome: Option<Outcome>,
    canceled: bool,
}

impl<'a> Run<'a> {
    fn new(ctl: &'a Controller, host: String, original: Config) -> Self {
        Self {
            ctl,
            host,
            settings: original.discovery.clone(),
            original,
            started: Instant::now(),
            phase: Phase::Pending,
            fraction: 0.0,
            addrs: Vec::new(),
            dns_bypass: None,
            payload: FakePayloadKind::default(),
            fingerprint: None,
            dns: None,
            baseline: None,
            trials: Vec::new(),
            working: Vec::new(),
            combined: Vec::new(),
            outcome: None,
            canceled: false,
        }
    }

    fn enter(&mut self, phase: Phase, message: &str) {
        self.phase = phase;
        self.fraction = 0.0;
        debug!(host = %self.host, phase = phase.as_str(), "discovery phase");
        self.publish(message);
    }

    fn advance(&mut self, done: usize, total: usize, message: &str) {
        self.fraction = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        self.publish(message);
    }

    fn publish(&self, message: &str) {
        if let Some(sender) = &self.ctl.progress {
            sender.send_replace(Progress::at(
                self.phase,
                self.fraction,
                self.trials.len(),
                message,
            ));
        }
    }

    fn stopped(&mut self) -> bool {
        if self.ctl.cancel.is_cancelled() {
            self.canceled = true;
        }
        self.canceled
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.probe_timeout_ms)
    }

    async fn execute(&mut self) {
        self.enter(Phase::Fingerprint, "fingerprinting");
        // Nothing the operator configured for the host may skew the probes
        let neutral = trial_config(
            &self.original,
            &self.host,
            &[],
            StrategyFamily::None.into_config(),
        );
        if let Err(e) = self.ctl.actuator.apply(neutral) {
            warn!(host = %self.host, error = %e, "could not neutralize configuration");
        }

        let network = Arc::clone(&self.ctl.network);
        let system = network.resolve_system(&self.host).await;
        let cancel = self.ctl.cancel.clone();
        let print = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            print = fingerprint(network.as_ref(), &self.host, system.first().copied(), &self.settings) => Some(print),
        };
        let Some(print) = print else {
            self.canceled = true;
            return;
        };
        let target_ok = print.target_ok;
        self.fingerprint = Some(print);

        if self.stopped() {
            return;
        }
        self.enter(Phase::DnsCheck, "comparing resolvers");
        let doh = network.resolve_doh(&self.host).await;
        let poisoned = self.dns_poisoned(&system, &doh).await;
        let trial_addr = if poisoned {
            doh.first().copied()
        } else {
            system.first().or_else(|| doh.first()).copied()
        };
        self.addrs = trial_addr.into_iter().collect();
        if poisoned {
            warn!(host = %self.host, ?system, ?doh, "system resolver answer looks poisoned");
            self.dns_bypass = Some(self.settings.bypass_resolver);
        }
        self.dns = Some(DnsReport {
            system,
            doh,
            poisoned,
            trial_addr,
        });

        if target_ok && !poisoned {
            info!(host = %self.host, "target reachable without bypass");
            self.outcome = Some(Outcome::Unblocked);
            return;
        }

        self.survey().await;
        if self.outcome.is_some() || self.stopped() {
            return;
        }
        self.optimize().await;
        if self.stopped() {
            return;
        }
        self.combine().await;
    }

    async fn dns_poisoned(&self, system: &[IpAddr], doh: &[IpAddr]) -> bool {
        let Some(verified) = doh.first() else {
            return false;
        };
        let Some(answer) = system.first() else {
            debug!(host = %self.host, %verified, "only DoH resolved the target");
            return true;
        };
        if system.iter().any(|addr| doh.contains(addr)) {
            return false;
        }
        // Disjoint answers are normal for CDNs; the system address must
        // also fail to answer TLS for the host
        let hello = HelloRequest {
            addr: *answer,
            sni: Some(self.host.clone()),
            ttl: None,
            timeout: self.probe_timeout(),
        };
        !self.ctl.network.hello(&hello).await.answered()
    }

    /// Initial config for a family, with the fingerprint's TTL hint
    fn seed(&self, family: StrategyFamily) -> EvasionConfig {
        let evasion = family.into_config();
        let hint = self.fingerprint.as_ref().and_then(Fingerprint::ttl_hint);
        match (family.tunable(), hint) {
            (Some(TunableParameter::FakeTtl), Some(hint)) => {
                with_ttl(evasion, hint.clamp(self.settings.ttl_min, self.settings.ttl_max))
            }
            _ => evasion,
        }
    }

    /// Apply run-wide choices: fake payload and DNS bypass
    fn finish_config(&self, evasion: EvasionConfig) -> EvasionConfig {
        self.with_dns(with_payload(evasion, self.payload))
    }

    fn with_dns(&self, evasion: EvasionConfig) -> EvasionConfig {
        match self.dns_bypass {
            Some(resolver) => with_dns_bypass(evasion, resolver),
            None => evasion,
        }
    }

    fn probe_request(&self) -> ProbeRequest {
        ProbeRequest {
            host: self.host.clone(),
            addr: self.addrs.first().copied(),
            path: self.settings.probe_path.clone(),
            timeout: self.probe_timeout(),
            stall_timeout: Duration::from_millis(self.settings.stall_timeout_ms),
            max_bytes: self.settings.download_bytes,
        }
    }

    /// Run one trial. Returns `None` once the run is canceled.
    async fn trial(
        &mut self,
        name: String,
        family: StrategyFamily,
        evasion: EvasionConfig,
    ) -> Option<TrialResult> {
        if let Some(done) = self.trials.iter().find(|t| {
            t.status != TrialStatus::Canceled && (t.name == name || t.evasion == evasion)
        }) {
            debug!(trial = %name, reused = %done.name, "trial already run");
            return Some(done.clone());
        }
        if self.stopped() {
            return None;
        }

        let config = trial_config(&self.original, &self.host, &self.addrs, evasion.clone());
        if let Err(e) = self.ctl.actuator.apply(config) {
            warn!(trial = %name, error = %e, "trial configuration rejected");
            let failed = ProbeOutcome::failure(FailureMode::Config, Duration::ZERO);
            let result = TrialResult::from_outcome(name, family, evasion, &failed);
            self.trials.push(result.clone());
            return Some(result);
        }

        let request = self.probe_request();
        let delay = Duration::from_millis(self.settings.propagation_delay_ms);
        let network = Arc::clone(&self.ctl.network);
        let cancel = self.ctl.cancel.clone();
        let probe = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            network.download(&request).await
        };
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = probe => Some(outcome),
        };

        let result = match outcome {
            Some(outcome) => TrialResult::from_outcome(name, family, evasion, &outcome),
            None => {
                self.canceled = true;
                TrialResult::canceled(name, family, evasion)
            }
        };
        info!(
            host = %self.host,
            trial = %result.name,
            status = ?result.status,
            failure = ?result.failure,
            throughput = result.throughput.round(),
            "trial finished"
        );
        self.trials.push(result.clone());
        self.publish(&result.name);
        (!self.canceled).then_some(result)
    }

    async fn survey(&mut self) {
        self.enter(Phase::Survey, "baseline");
        let baseline = self.with_dns(StrategyFamily::None.into_config());
        let Some(baseline) = self.trial("baseline".into(), StrategyFamily::None, baseline).await
        else {
            return;
        };
        self.baseline = Some(baseline.clone());
        if baseline.is_success() {
            info!(host = %self.host, "baseline works, no bypass needed");
            self.outcome = Some(Outcome::NoBypassNeeded);
            self.working.push(baseline);
            return;
        }

        let recommended = self
            .fingerprint
            .as_ref()
            .map(|f| f.recommended.clone())
            .unwrap_or_default();
        let order = family_order(baseline.failure, &recommended);
        debug!(host = %self.host, ?order, "survey order");

        let mut payload_done = false;
        if order.contains(&StrategyFamily::FakeSni) {
            if !self.detect_payload().await {
                return;
            }
            payload_done = true;
        }

        let total = order.len();
        for (index, family) in order.into_iter().enumerate() {
            self.advance(index, total, family.name());
            if family == StrategyFamily::FakeSni && payload_done {
                continue;
            }
            let evasion = self.finish_config(self.seed(family));
            match self.trial(format!("phase1/{family}"), family, evasion).await {
                None => return,
                Some(result) if result.is_success() => self.working.push(result),
                Some(_) => {}
            }
        }
    }

    /// Try both canned fake payloads; the faster working one is used from
    /// here on. Returns `false` if canceled.
    async fn detect_payload(&mut self) -> bool {
        let mut best: Option<TrialResult> = None;
        for (kind, label) in [
            (FakePayloadKind::Default1, "default1"),
            (FakePayloadKind::Default2, "default2"),
        ] {
            let evasion = self.with_dns(with_payload(self.seed(StrategyFamily::FakeSni), kind));
            let Some(result) = self
                .trial(format!("phase1/payload/{label}"), StrategyFamily::FakeSni, evasion)
                .await
            else {
                return false;
            };
            if result.is_success() && best.as_ref().map_or(true, |b| result.throughput > b.throughput)
            {
                self.payload = kind;
                best = Some(result);
            }
        }
        if let Some(best) = best {
            debug!(host = %self.host, payload = ?self.payload, "fake payload selected");
            self.working.push(best);
        }
        true
    }

    async fn optimize(&mut self) {
        self.enter(Phase::Optimize, "optimizing");
        let seeds = self.working.clone();
        let total = seeds.len();
        for (index, seed) in seeds.into_iter().enumerate() {
            self.advance(index, total, seed.family.name());
            let tuned = match seed.family.tunable() {
                Some(TunableParameter::FakeTtl) if ttl_of(&seed.evasion).is_some() => {
                    self.tune_ttl(seed).await
                }
                Some(TunableParameter::SplitPosition) if position_of(&seed.evasion).is_some() => {
                    self.tune_position(seed).await
                }
                _ => self.try_presets(seed).await,
            };
            self.working[index] = tuned;
            if self.canceled {
                return;
            }
        }
    }

    /// Highest TTL that still works, hint first, then two TTLs above it
    async fn tune_ttl(&mut self, seed: TrialResult) -> TrialResult {
        let family = seed.family;
        let Some(start) = ttl_of(&seed.evasion) else {
            return seed;
        };
        let ceiling = self.settings.ttl_max;
        let mut search = Bisection::new(usize::from(start), usize::from(ceiling) + 1);
        let mut pending = self
            .fingerprint
            .as_ref()
            .and_then(Fingerprint::ttl_hint)
            .map(usize::from)
            .filter(|hint| search.contains(*hint));
        let mut best = seed.clone();

        while let Some(value) = pending.take().or_else(|| search.next()) {
            let ttl = u8::try_from(value).unwrap_or(ceiling);
            let Some(result) = self
                .trial(
                    format!("phase2/{family}/ttl={ttl}"),
                    family,
                    with_ttl(seed.evasion.clone(), ttl),
                )
                .await
            else {
                return best;
            };
            search.record(value, result.is_success());
            if result.is_success() && result.throughput >= best.throughput {
                best = result;
            }
        }

        let boundary = search.boundary();
        for value in [boundary + 1, boundary + 2] {
            let Ok(ttl) = u8::try_from(value) else {
                break;
            };
            if ttl > ceiling {
                break;
            }
            let Some(result) = self
                .trial(
                    format!("phase2/{family}/ttl={ttl}"),
                    family,
                    with_ttl(seed.evasion.clone(), ttl),
                )
                .await
            else {
                return best;
            };
            if result.is_success() && result.throughput > best.throughput {
                best = result;
            }
        }
        best
    }

    /// Furthest split position that still works
    async fn tune_position(&mut self, seed: TrialResult) -> TrialResult {
        let family = seed.family;
        let Some(start) = position_of(&seed.evasion) else {
            return seed;
        };
        let mut search = Bisection::new(start, self.settings.split_max + 1);
        let mut best = seed.clone();
        while let Some(position) = search.next() {
            let Some(result) = self
                .trial(
                    format!("phase2/{family}/position={position}"),
                    family,
                    with_position(seed.evasion.clone(), position),
                )
                .await
            else {
                return best;
            };
            search.record(position, result.is_success());
            if result.is_success() && result.throughput >= best.throughput {
                best = result;
            }
        }
        best
    }

    /// Fixed presets for families without a numeric parameter
    async fn try_presets(&mut self, seed: TrialResult) -> TrialResult {
        let family = seed.family;
        let mut best = seed;
        for (index, preset) in family.presets().into_iter().enumerate().skip(1) {
            let evasion = self.finish_config(preset);
            let Some(result) = self
                .trial(format!("phase2/{family}/preset={index}"), family, evasion)
                .await
            else {
                return best;
            };
            if result.is_success() && result.throughput > best.throughput {
                best = result;
            }
        }
        best
    }

    async fn combine(&mut self) {
        if self.working.len() < 2 {
            return;
        }
        self.enter(Phase::Combine, "combining");
        let mut ranked = self.working.clone();
        ranked.sort_by(|a, b| b.throughput.total_cmp(&a.throughput));
        ranked.truncate(COMBINE_TOP);

        let limit = self.settings.max_combinations;
        let mut pairs = Vec::new();
        for a in &ranked {
            for b in &ranked {
                if a.family == b.family {
                    continue;
                }
                if let Some(evasion) = combine(&a.evasion, &b.evasion) {
                    pairs.push((a.family, b.family, evasion));
                }
            }
        }
        pairs.truncate(limit);

        let total = pairs.len();
        for (index, (first, second, evasion)) in pairs.into_iter().enumerate() {
            self.advance(index, total, "combination");
            match self
                .trial(format!("phase3/{first}+{second}"), first, evasion)
                .await
            {
                None => return,
                Some(result) if result.is_success() => self.combined.push(result),
                Some(_) => {}
            }
        }
    }

    fn finish(mut self) -> DiscoveryReport {
        self.enter(Phase::Finalize, "restoring configuration");
        if let Err(e) = self.ctl.actuator.apply(self.original.clone()) {
            warn!(host = %self.host, error = %e, "could not restore configuration");
        }

        let best = self
            .working
            .iter()
            .chain(&self.combined)
            .filter(|t| t.is_success())
            .fold(None::<&TrialResult>, |best, t| match best {
                Some(b) if b.throughput >= t.throughput => Some(b),
                _ => Some(t),
            })
            .cloned();

        let outcome = match (self.outcome, &best) {
            (Some(outcome), _) => outcome,
            (None, Some(_)) => Outcome::Found,
            (None, None) if self.canceled => Outcome::Canceled,
            (None, None) => Outcome::NotFound,
        };

        let baseline_speed = self
            .baseline
            .as_ref()
            .filter(|b| b.is_success())
            .map(|b| b.throughput);
        let reference_throughput = self
            .fingerprint
            .as_ref()
            .filter(|f| f.reference_ok)
            .map(|f| f.reference_throughput);
        let improvement = best.as_ref().map_or(0.0, |b| {
            improvement_pct(b.throughput, baseline_speed, reference_throughput)
        });

        self.phase = Phase::Done;
        self.fraction = 1.0;
        self.publish(outcome.as_str());
        info!(
            host = %self.host,
            outcome = %outcome,
            best = best.as_ref().map(|b| b.name.as_str()),
            trials = self.trials.len(),
            improvement_pct = improvement.round(),
            "discovery finished"
        );

        DiscoveryReport {
            host: self.host,
            outcome,
            fingerprint: self.fingerprint,
            dns: self.dns,
            baseline: self.baseline,
            reference_throughput,
            best,
            improvement_pct: improvement,
            trials: self.trials,
            canceled: self.canceled,
            elapsed_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}
