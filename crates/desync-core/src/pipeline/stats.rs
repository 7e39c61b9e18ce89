//! Per-worker counters

use std::fmt;

/// Processing statistics of one worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Packets seen
    pub packets_processed: u64,
    /// Packets that failed to parse and were accepted
    pub parse_errors: u64,
    /// ClientHellos seen on TCP (matched or not)
    pub hellos_seen: u64,
    /// ClientHellos or QUIC Initials that matched a target set
    pub targets_matched: u64,
    /// Send plans handed to the sender
    pub plans_built: u64,
    /// Matched packets passed through because no plan could be built
    pub passthrough: u64,
    /// QUIC Initials that matched
    pub quic_matched: u64,
    /// SYNs replaced with decoys
    pub syn_fakes: u64,
    /// DNS queries redirected
    pub dns_redirected: u64,
    /// DNS responses rewritten back
    pub dns_restored: u64,
}

impl Stats {
    /// Add another worker's counters
    pub fn merge(&mut self, other: &Stats) {
        self.packets_processed += other.packets_processed;
        self.parse_errors += other.parse_errors;
        self.hellos_seen += other.hellos_seen;
        self.targets_matched += other.targets_matched;
        self.plans_built += other.plans_built;
        self.passthrough += other.passthrough;
        self.quic_matched += other.quic_matched;
        self.syn_fakes += other.syn_fakes;
        self.dns_redirected += other.dns_redirected;
        self.dns_restored += other.dns_restored;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} matched={} plans={} passthrough={} quic={} syn_fakes={} dns={}/{} parse_errors={}",
            self.packets_processed,
            self.targets_matched,
            self.plans_built,
            self.passthrough,
            self.quic_matched,
            self.syn_fakes,
            self.dns_redirected,
            self.dns_restored,
            self.parse_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        let mut total = Stats {
            packets_processed: 100,
            plans_built: 5,
            ..Stats::default()
        };
        total.merge(&Stats {
            packets_processed: 50,
            dns_redirected: 2,
            ..Stats::default()
        });
        assert_eq!(total.packets_processed, 150);
        assert_eq!(total.plans_built, 5);
        assert_eq!(total.dns_redirected, 2);
        assert!(total.to_string().starts_with("processed=150"));
    }
}
