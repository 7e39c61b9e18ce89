//! Search helpers
//!
//! Pure functions the controller composes: the boundary bisection used for
//! numeric parameters, family ordering from the observed failure, and the
//! parameter edits applied to family presets.

use crate::model::FailureMode;
use desync_core::config::{EvasionConfig, FakePayloadKind, FragStrategy, StrategyFamily};
use std::net::SocketAddr;

/// Binary search for the boundary between a known-good and a known-bad value
///
/// Works in either direction: `good` may lie above or below `bad`. The
/// search ends when the two are adjacent, and [`Bisection::boundary`] is the
/// good value furthest from where it started.
///
/// ```
/// use desync_discovery::Bisection;
///
/// let mut search = Bisection::new(3, 33);
/// while let Some(ttl) = search.next() {
///     search.record(ttl, ttl <= 7);
/// }
/// assert_eq!(search.boundary(), 7);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bisection {
    good: usize,
    bad: usize,
}

impl Bisection {
    /// Search between a value known to work and one known to fail
    pub fn new(good: usize, bad: usize) -> Self {
        Self { good, bad }
    }

    /// Next value to test, or `None` once the boundary is found
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Option<usize> {
        if self.good.abs_diff(self.bad) <= 1 {
            return None;
        }
        Some(self.good.min(self.bad) + self.good.abs_diff(self.bad) / 2)
    }

    /// Whether `value` lies strictly between the current bounds
    pub fn contains(&self, value: usize) -> bool {
        value > self.good.min(self.bad) && value < self.good.max(self.bad)
    }

    /// Record a test result. Values outside the window are ignored.
    pub fn record(&mut self, value: usize, ok: bool) {
        if !self.contains(value) {
            return;
        }
        if ok {
            self.good = value;
        } else {
            self.bad = value;
        }
    }

    /// Furthest value known to work
    pub fn boundary(&self) -> usize {
        self.good
    }
}

/// Families most likely to defeat an observed failure, best first
pub fn failure_bias(mode: Option<FailureMode>) -> &'static [StrategyFamily] {
    use StrategyFamily::*;
    match mode {
        Some(FailureMode::Reset) => &[FakeSni, Desync, Hybrid, SynFake, Disorder],
        Some(FailureMode::Timeout | FailureMode::Stall) => {
            &[TcpFrag, IpFrag, TlsRecordSplit, Disorder, Combo]
        }
        Some(FailureMode::TlsAlert) => &[SniMutation, TlsRecordSplit, ExtensionSplit, Overlap],
        Some(FailureMode::Redirect | FailureMode::BlockPage) => {
            &[TlsRecordSplit, TcpFrag, SniMutation]
        }
        _ => &[],
    }
}

/// Survey order: failure bias, then fingerprint ranking, then the rest
pub fn family_order(
    failure: Option<FailureMode>,
    recommended: &[StrategyFamily],
) -> Vec<StrategyFamily> {
    let mut order = Vec::with_capacity(StrategyFamily::SURVEY.len());
    let candidates = failure_bias(failure)
        .iter()
        .chain(recommended)
        .chain(StrategyFamily::SURVEY.iter());
    for family in candidates {
        if *family != StrategyFamily::None && !order.contains(family) {
            order.push(*family);
        }
    }
    order
}

/// TTL the config's injected packets use, if any
pub fn ttl_of(evasion: &EvasionConfig) -> Option<u8> {
    if evasion.desync.enabled {
        Some(evasion.desync.ttl)
    } else if evasion.fake.enabled || evasion.fake.syn_fake {
        Some(evasion.fake.ttl)
    } else {
        None
    }
}

/// Set the TTL of every enabled injection layer
pub fn with_ttl(mut evasion: EvasionConfig, ttl: u8) -> EvasionConfig {
    if evasion.desync.enabled {
        evasion.desync.ttl = ttl;
    }
    if evasion.fake.enabled || evasion.fake.syn_fake {
        evasion.fake.ttl = ttl;
    }
    evasion
}

/// Split position, if the fragmentation strategy takes one
pub fn position_of(evasion: &EvasionConfig) -> Option<usize> {
    match evasion.fragmentation.strategy {
        FragStrategy::TcpFrag | FragStrategy::IpFrag | FragStrategy::Oob => {
            Some(evasion.fragmentation.position)
        }
        _ => None,
    }
}

/// Fixed split position; SNI-relative splitting is turned off
pub fn with_position(mut evasion: EvasionConfig, position: usize) -> EvasionConfig {
    evasion.fragmentation.position = position;
    evasion.fragmentation.middle_sni = false;
    evasion
}

/// Use `payload` for fake packets when faking is enabled
pub fn with_payload(mut evasion: EvasionConfig, payload: FakePayloadKind) -> EvasionConfig {
    if evasion.fake.enabled || evasion.fake.syn_fake {
        evasion.fake.payload = payload;
    }
    evasion
}

/// Redirect DNS for the set through `resolver`
pub fn with_dns_bypass(mut evasion: EvasionConfig, resolver: SocketAddr) -> EvasionConfig {
    evasion.dns.enabled = true;
    evasion.dns.resolver = Some(resolver.ip());
    evasion.dns.port = resolver.port();
    evasion
}

/// Layer `b`'s injections onto `a`'s fragmentation
///
/// Returns `None` when the result would equal either input.
pub fn combine(a: &EvasionConfig, b: &EvasionConfig) -> Option<EvasionConfig> {
    let mut out = a.clone();
    if out.fragmentation.strategy == FragStrategy::None {
        out.fragmentation = b.fragmentation.clone();
    }
    if !(out.fake.enabled || out.fake.syn_fake) && (b.fake.enabled || b.fake.syn_fake) {
        out.fake = b.fake.clone();
    }
    if !out.desync.enabled && b.desync.enabled {
        out.desync = b.desync.clone();
    }
    if !out.mutation.enabled && b.mutation.enabled {
        out.mutation = b.mutation.clone();
    }
    if out == *a || out == *b {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ============ Bisection Tests ============

    #[test]
    fn test_ttl_converges_to_seven() {
        let mut search = Bisection::new(3, 33);
        let mut trials = 0;
        while let Some(ttl) = search.next() {
            trials += 1;
            search.record(ttl, ttl <= 7);
        }
        assert_eq!(search.boundary(), 7);
        assert!(trials <= 5, "took {trials} trials");
    }

    #[test]
    fn test_downward_search() {
        // Smallest value that works, starting from a known-good maximum
        let mut search = Bisection::new(32, 0);
        while let Some(ttl) = search.next() {
            search.record(ttl, ttl >= 9);
        }
        assert_eq!(search.boundary(), 9);
    }

    #[test]
    fn test_outside_window_ignored() {
        let mut search = Bisection::new(3, 10);
        search.record(12, true);
        search.record(1, false);
        assert_eq!(search, Bisection::new(3, 10));
        assert!(Bisection::new(4, 5).next().is_none());
    }

    proptest! {
        #[test]
        fn prop_bisection_finds_threshold(threshold in 3usize..=32) {
            let mut search = Bisection::new(3, 33);
            let mut trials = 0;
            while let Some(v) = search.next() {
                trials += 1;
                search.record(v, v <= threshold);
            }
            prop_assert_eq!(search.boundary(), threshold);
            prop_assert!(trials <= 5);
        }
    }

    // ============ Ordering Tests ============

    #[test]
    fn test_family_order_dedup() {
        let order = family_order(
            Some(FailureMode::Reset),
            &[StrategyFamily::Desync, StrategyFamily::TcpFrag, StrategyFamily::None],
        );
        assert_eq!(order[0], StrategyFamily::FakeSni);
        assert_eq!(order[1], StrategyFamily::Desync);
        assert_eq!(order[5], StrategyFamily::TcpFrag);
        assert_eq!(order.len(), StrategyFamily::SURVEY.len());
        assert!(!order.contains(&StrategyFamily::None));
    }

    #[test]
    fn test_no_failure_keeps_survey_order() {
        assert_eq!(family_order(None, &[]), StrategyFamily::SURVEY.to_vec());
    }

    // ============ Parameter Tests ============

    #[test]
    fn test_ttl_edits() {
        let fake = with_ttl(StrategyFamily::FakeSni.into_config(), 9);
        assert_eq!(ttl_of(&fake), Some(9));
        let desync = with_ttl(StrategyFamily::Desync.into_config(), 5);
        assert_eq!(desync.desync.ttl, 5);
        assert_eq!(ttl_of(&StrategyFamily::TcpFrag.into_config()), None);
    }

    #[test]
    fn test_position_edits() {
        let hybrid = StrategyFamily::Hybrid.into_config();
        assert!(hybrid.fragmentation.middle_sni);
        let fixed = with_position(hybrid, 12);
        assert_eq!(position_of(&fixed), Some(12));
        assert!(!fixed.fragmentation.middle_sni);
        assert_eq!(position_of(&StrategyFamily::Disorder.into_config()), None);
    }

    #[test]
    fn test_dns_bypass_edit() {
        let resolver: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let evasion = with_dns_bypass(StrategyFamily::None.into_config(), resolver);
        assert!(evasion.validate("sets[0]").is_ok());
        assert_eq!(evasion.dns.port, 53);
    }

    // ============ Combination Tests ============

    #[test]
    fn test_combine_fake_onto_frag() {
        let frag = StrategyFamily::TcpFrag.into_config();
        let fake = StrategyFamily::FakeSni.into_config();
        let combined = combine(&frag, &fake).unwrap();
        assert_eq!(combined.fragmentation.strategy, FragStrategy::TcpFrag);
        assert!(combined.fake.enabled);

        let reversed = combine(&fake, &frag).unwrap();
        assert_eq!(reversed.fragmentation.strategy, FragStrategy::TcpFrag);
        assert!(reversed.fake.enabled);
    }

    #[test]
    fn test_combine_identical_is_skipped() {
        let frag = StrategyFamily::TcpFrag.into_config();
        let record = StrategyFamily::TlsRecordSplit.into_config();
        assert!(combine(&frag, &record).is_none());
        assert!(combine(&frag, &frag).is_none());
    }
}
