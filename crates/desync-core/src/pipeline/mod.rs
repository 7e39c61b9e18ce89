//! Per-packet processing
//!
//! A [`Processor`] belongs to one queue worker and owns that worker's flow
//! table and QUIC reassembly state. It classifies each intercepted packet
//! and returns a [`Decision`] for the queue. Every error on this path fails
//! open: the packet is accepted unmodified.

mod stats;

pub use stats::Stats;

use crate::config::{CompiledConfig, ConfigHandle};
use crate::conntrack::{
    DnsConnTracker, FlowKey, FlowTracker, FlowVerdict, OriginalDestination, QueryKey,
};
use crate::error::Result;
use crate::packet::{Direction, Packet};
use crate::quic::{QuicExtraction, QuicExtractor};
use crate::strategies::{self, SendPlan};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace};

const HTTPS_PORT: u16 = 443;
const DNS_PORT: u16 = 53;

/// Verdict for one intercepted packet
#[derive(Debug, Clone)]
pub enum Decision {
    /// Let the packet through unmodified
    Accept,
    /// Drop the packet and send the plan in its place
    Replace(SendPlan),
    /// Let the packet through with rewritten bytes
    Rewrite(Packet),
}

impl Decision {
    /// True for [`Decision::Accept`]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Packet classifier and plan builder for one worker
#[derive(Debug)]
pub struct Processor {
    config: Arc<ConfigHandle>,
    dns: Arc<DnsConnTracker>,
    flows: FlowTracker,
    quic: QuicExtractor,
    stats: Stats,
}

impl Processor {
    /// Create a processor. Flow and QUIC limits are read from the
    /// configuration current at this point.
    pub fn new(config: Arc<ConfigHandle>, dns: Arc<DnsConnTracker>) -> Self {
        let snapshot = config.load();
        let flows = FlowTracker::new(snapshot.config.flow.limits());
        let quic = QuicExtractor::new(snapshot.config.quic.limits(), snapshot.config.quic.decrypt);
        Self {
            config,
            dns,
            flows,
            quic,
            stats: Stats::default(),
        }
    }

    /// Classify one packet
    pub fn process(&mut self, data: &[u8], direction: Direction) -> Decision {
        self.process_at(data, direction, Instant::now())
    }

    /// Classify one packet with an explicit clock
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub fn process_at(&mut self, data: &[u8], direction: Direction, now: Instant) -> Decision {
        self.stats.packets_processed += 1;
        let packet = match Packet::from_bytes(data, direction) {
            Ok(p) => p,
            Err(e) => {
                self.stats.parse_errors += 1;
                trace!(error = %e, "unparseable packet accepted");
                return Decision::Accept;
            }
        };
        if packet.is_fragment {
            return Decision::Accept;
        }

        let snapshot = self.config.load();
        match direction {
            Direction::Outbound if packet.is_tcp() && packet.dst_port == HTTPS_PORT => {
                if packet.is_syn() {
                    self.on_syn(&packet, &snapshot)
                } else if packet.payload_len() > 0 {
                    self.on_tls_segment(&packet, &snapshot, now)
                } else {
                    Decision::Accept
                }
            }
            Direction::Outbound if packet.is_udp() && packet.dst_port == HTTPS_PORT => {
                if snapshot.config.quic.enabled {
                    self.on_quic(&packet, &snapshot, now)
                } else {
                    Decision::Accept
                }
            }
            Direction::Outbound if packet.is_udp() && packet.dst_port == DNS_PORT => {
                if snapshot.dns_bypass_enabled() {
                    self.on_dns_query(&packet, &snapshot, now)
                } else {
                    Decision::Accept
                }
            }
            Direction::Inbound
                if packet.is_udp() && snapshot.is_dns_resolver(packet.src_addr, packet.src_port) =>
            {
                self.on_dns_response(&packet, now)
            }
            _ => Decision::Accept,
        }
    }

    fn replace(&mut self, result: Result<SendPlan>) -> Decision {
        match result {
            Ok(plan) => {
                self.stats.plans_built += 1;
                Decision::Replace(plan)
            }
            Err(e) => {
                self.stats.passthrough += 1;
                debug!(error = %e, "no plan, passing packet through");
                Decision::Accept
            }
        }
    }

    fn on_syn(&mut self, packet: &Packet, snapshot: &CompiledConfig) -> Decision {
        let Some(set) = snapshot.match_ip(packet.dst_addr) else {
            return Decision::Accept;
        };
        if !set.evasion.fake.syn_fake {
            return Decision::Accept;
        }
        self.stats.syn_fakes += 1;
        debug!(dst = %packet.dst_addr, set = %set.name, "sending fake SYNs");
        let plan = strategies::plan_syn(packet, set);
        self.replace(plan)
    }

    /// A hostname matching a domain set wins. A ClientHello whose hostname
    /// is absent or matches no domain set falls back to the first set whose
    /// networks contain the destination address.
    fn on_tls_segment(&mut self, packet: &Packet, snapshot: &CompiledConfig, now: Instant) -> Decision {
        let key = FlowKey::from_packet(packet);
        let FlowVerdict::Resolved { layout, prefix_len } =
            self.flows.feed_at(key, packet.tcp_seq(), packet.payload(), now)
        else {
            return Decision::Accept;
        };
        self.stats.hellos_seen += 1;

        let host = layout.hostname.as_deref();
        let Some(set) = host
            .and_then(|h| snapshot.match_host(h))
            .or_else(|| snapshot.match_ip(packet.dst_addr))
        else {
            trace!(host, "ClientHello not targeted");
            return Decision::Accept;
        };
        self.stats.targets_matched += 1;
        debug!(
            host,
            dst = %packet.dst_addr,
            set = %set.name,
            prefix_len,
            "ClientHello matched"
        );

        let layout = layout.rebase(prefix_len);
        let plan = strategies::plan_client_hello(packet, layout.as_ref(), set);
        self.replace(plan)
    }

    fn on_quic(&mut self, packet: &Packet, snapshot: &CompiledConfig, now: Instant) -> Decision {
        let QuicExtraction::Parsed(layout) = self.quic.feed_at(packet.payload(), now) else {
            return Decision::Accept;
        };
        let host = layout.hostname.as_deref();
        let Some(set) = host
            .and_then(|h| snapshot.match_host(h))
            .or_else(|| snapshot.match_ip(packet.dst_addr))
        else {
            return Decision::Accept;
        };
        self.stats.targets_matched += 1;
        self.stats.quic_matched += 1;
        debug!(host, set = %set.name, "QUIC Initial matched");
        let plan = strategies::plan_datagram(packet, set);
        self.replace(plan)
    }

    fn on_dns_query(&mut self, packet: &Packet, snapshot: &CompiledConfig, now: Instant) -> Decision {
        let payload = packet.payload();
        let (Some(name), Some(txid)) =
            (strategies::query_name(payload), strategies::dns_txid(payload))
        else {
            return Decision::Accept;
        };
        let Some(set) = snapshot.match_host(&name) else {
            return Decision::Accept;
        };
        let dns = &set.evasion.dns;
        let (true, Some(resolver)) = (dns.enabled, dns.resolver) else {
            return Decision::Accept;
        };

        match strategies::redirect_query(packet, resolver, dns.port) {
            Ok(redirected) => {
                self.dns.track_query_at(
                    QueryKey {
                        client_port: packet.src_port,
                        txid,
                    },
                    OriginalDestination {
                        addr: packet.dst_addr,
                        port: packet.dst_port,
                    },
                    now,
                );
                self.stats.dns_redirected += 1;
                debug!(%name, %resolver, "DNS query redirected");
                Decision::Rewrite(redirected)
            }
            Err(e) => {
                debug!(%name, error = %e, "DNS query not redirected");
                Decision::Accept
            }
        }
    }

    fn on_dns_response(&mut self, packet: &Packet, now: Instant) -> Decision {
        let payload = packet.payload();
        if !strategies::is_dns_response(payload) {
            return Decision::Accept;
        }
        let Some(txid) = strategies::dns_txid(payload) else {
            return Decision::Accept;
        };
        let key = QueryKey {
            client_port: packet.dst_port,
            txid,
        };
        let Some(original) = self.dns.take_original_at(key, now) else {
            return Decision::Accept;
        };
        match strategies::restore_response(packet, &original) {
            Ok(restored) => {
                self.stats.dns_restored += 1;
                Decision::Rewrite(restored)
            }
            Err(e) => {
                debug!(error = %e, "DNS response not restored");
                Decision::Accept
            }
        }
    }

    /// Drop idle flow and QUIC state; returns how many entries went
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let swept = self.flows.sweep_at(now) + self.quic.sweep_at(now);
        if swept > 0 {
            trace!(swept, "swept idle flows");
        }
        swept
    }

    /// Counters so far
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Flows awaiting a complete ClientHello
    pub fn pending_flows(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FragStrategy, StrategyFamily};
    use crate::packet::{PacketBuilder, TcpFlags};
    use crate::tls::ClientHelloBuilder;
    use std::net::{IpAddr, Ipv4Addr};

    fn processor(config: Config) -> Processor {
        Processor::new(
            Arc::new(ConfigHandle::new(config).unwrap()),
            Arc::new(DnsConnTracker::new()),
        )
    }

    fn hello_bytes(seq: u32, payload: &[u8]) -> Vec<u8> {
        PacketBuilder::tcp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4([203, 0, 113, 5])
            .src_port(40000)
            .dst_port(443)
            .seq(seq)
            .flags(TcpFlags::data())
            .payload(payload)
            .build()
    }

    fn targeting(domain: &str) -> Config {
        Config::from_family(StrategyFamily::TcpFrag, vec![domain.to_string()])
    }

    #[test]
    fn test_unparseable_accepted() {
        let mut p = processor(targeting("blocked.example"));
        assert!(p.process(&[0x45, 0x00], Direction::Outbound).is_accept());
        assert_eq!(p.stats().parse_errors, 1);
    }

    #[test]
    fn test_matched_hello_replaced() {
        let mut p = processor(targeting("blocked.example"));
        let record = ClientHelloBuilder::new("www.blocked.example").build_record();
        let decision = p.process(&hello_bytes(100, &record), Direction::Outbound);
        let Decision::Replace(plan) = decision else {
            panic!("expected replacement, got {decision:?}");
        };
        assert_eq!(plan.len(), 2);
        assert_eq!(p.stats().targets_matched, 1);
    }

    #[test]
    fn test_unmatched_hello_accepted() {
        let mut p = processor(targeting("blocked.example"));
        let record = ClientHelloBuilder::new("allowed.example").build_record();
        assert!(p.process(&hello_bytes(100, &record), Direction::Outbound).is_accept());
        assert_eq!(p.stats().hellos_seen, 1);
        assert_eq!(p.stats().targets_matched, 0);
    }

    #[test]
    fn test_split_hello_replaces_completing_segment() {
        let mut p = processor(targeting("blocked.example"));
        let record = ClientHelloBuilder::new("www.blocked.example").build_record();
        let (head, tail) = record.split_at(20);
        assert!(p.process(&hello_bytes(100, head), Direction::Outbound).is_accept());
        assert_eq!(p.pending_flows(), 1);

        let decision = p.process(&hello_bytes(120, tail), Direction::Outbound);
        let Decision::Replace(plan) = decision else {
            panic!("expected replacement, got {decision:?}");
        };
        let first = plan.packets().next().unwrap();
        assert_eq!(first.tcp_seq(), Some(120));
        assert_eq!(p.pending_flows(), 0);
    }

    #[test]
    fn test_domain_set_wins_over_network_set() {
        let mut config = targeting("blocked.example");
        let by_name = config.sets[0].evasion.fragmentation.position;
        let mut by_network = config.sets[0].clone();
        by_network.name = "by_network".into();
        by_network.domains.clear();
        by_network.cidrs.push("203.0.113.0/24".into());
        by_network.evasion.fragmentation.position = by_name + 5;
        config.sets.insert(0, by_network);
        let mut p = processor(config);

        let first_len = |p: &mut Processor, host: &str| {
            let record = ClientHelloBuilder::new(host).build_record();
            let decision = p.process(&hello_bytes(100, &record), Direction::Outbound);
            let Decision::Replace(plan) = decision else {
                panic!("expected replacement for {host}, got {decision:?}");
            };
            let len = plan.packets().next().unwrap().payload_len();
            len
        };

        // The network set is listed first, the hostname still selects by name
        assert_eq!(first_len(&mut p, "www.blocked.example"), by_name);
        // Unmatched hostname to a targeted network uses the network set
        assert_eq!(first_len(&mut p, "allowed.example"), by_name + 5);
        assert_eq!(p.stats().targets_matched, 2);
    }

    #[test]
    fn test_inbound_ignored() {
        let mut p = processor(targeting("blocked.example"));
        let record = ClientHelloBuilder::new("www.blocked.example").build_record();
        assert!(p.process(&hello_bytes(100, &record), Direction::Inbound).is_accept());
    }

    #[test]
    fn test_syn_fake_for_target_network() {
        let mut config = targeting("blocked.example");
        config.sets[0].cidrs.push("203.0.113.0/24".into());
        config.sets[0].evasion.fake.syn_fake = true;
        let mut p = processor(config);

        let syn = PacketBuilder::tcp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4([203, 0, 113, 5])
            .src_port(40000)
            .dst_port(443)
            .flags(TcpFlags::syn())
            .build();
        assert!(matches!(p.process(&syn, Direction::Outbound), Decision::Replace(_)));
        assert_eq!(p.stats().syn_fakes, 1);
    }

    #[test]
    fn test_dns_redirect_round_trip() {
        let mut config = targeting("blocked.example");
        let resolver = IpAddr::V4(Ipv4Addr::new(77, 88, 8, 8));
        config.sets[0].evasion.dns.enabled = true;
        config.sets[0].evasion.dns.resolver = Some(resolver);
        config.sets[0].evasion.fragmentation.strategy = FragStrategy::None;
        let mut p = processor(config);

        let mut query = vec![0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        for label in ["www", "blocked", "example"] {
            query.push(u8::try_from(label.len()).unwrap());
            query.extend_from_slice(label.as_bytes());
        }
        query.extend_from_slice(&[0, 0, 1, 0, 1]);
        let out = PacketBuilder::udp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4([192, 168, 1, 1])
            .src_port(53001)
            .dst_port(53)
            .payload(&query)
            .build();
        let Decision::Rewrite(redirected) = p.process(&out, Direction::Outbound) else {
            panic!("expected rewrite");
        };
        assert_eq!(redirected.dst_addr, resolver);

        let response = PacketBuilder::udp_v4()
            .src_ip_v4([77, 88, 8, 8])
            .dst_ip_v4([10, 0, 0, 2])
            .src_port(53)
            .dst_port(53001)
            .payload(&[0xAB, 0xCD, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0])
            .build();
        let Decision::Rewrite(restored) = p.process(&response, Direction::Inbound) else {
            panic!("expected rewrite");
        };
        assert_eq!(restored.src_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        // A second response with the same txid has nothing to restore
        assert!(p.process(&response, Direction::Inbound).is_accept());
    }

    #[test]
    fn test_hot_swap_seen_by_next_packet() {
        let handle = Arc::new(ConfigHandle::new(targeting("blocked.example")).unwrap());
        let mut p = Processor::new(Arc::clone(&handle), Arc::new(DnsConnTracker::new()));
        let record = ClientHelloBuilder::new("www.other.example").build_record();
        assert!(p.process(&hello_bytes(1, &record), Direction::Outbound).is_accept());

        handle.update(targeting("other.example")).unwrap();
        let bytes = PacketBuilder::tcp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4([203, 0, 113, 5])
            .src_port(40001)
            .dst_port(443)
            .seq(1)
            .flags(TcpFlags::data())
            .payload(&record)
            .build();
        assert!(matches!(p.process(&bytes, Direction::Outbound), Decision::Replace(_)));
    }

    #[test]
    fn test_sweep_drops_idle_partial_flows() {
        let mut p = processor(targeting("blocked.example"));
        let record = ClientHelloBuilder::new("www.blocked.example").build_record();
        let start = Instant::now();
        p.process_at(&hello_bytes(100, &record[..20]), Direction::Outbound, start);
        assert_eq!(p.sweep_at(start + std::time::Duration::from_secs(1)), 0);
        assert_eq!(p.sweep_at(start + std::time::Duration::from_secs(6)), 1);
        assert_eq!(p.pending_flows(), 0);
    }
}
