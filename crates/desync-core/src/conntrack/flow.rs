//! TCP flow reassembly for ClientHello detection
//!
//! One [`FlowTracker`] belongs to one worker. The kernel pins a flow to a
//! queue, so the table is never shared and needs no locking.

use super::Recency;
use crate::packet::Packet;
use crate::tls::{self, ClientHelloLayout, Extraction};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::trace;

/// TCP 4-tuple identity
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct FlowKey {
    /// Source address
    pub src: IpAddr,
    /// Source port
    pub src_port: u16,
    /// Destination address
    pub dst: IpAddr,
    /// Destination port
    pub dst_port: u16,
}

impl FlowKey {
    /// Key for a parsed packet
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            src: packet.src_addr,
            src_port: packet.src_port,
            dst: packet.dst_addr,
            dst_port: packet.dst_port,
        }
    }
}

/// Bounds for the flow table
#[derive(Debug, Clone, Copy)]
pub struct FlowLimits {
    /// Maximum accumulated payload per flow
    pub max_bytes: usize,
    /// Idle time after which a flow is swept
    pub ttl: Duration,
    /// Maximum tracked flows; the oldest is evicted when full
    pub max_flows: usize,
}

impl Default for FlowLimits {
    fn default() -> Self {
        Self {
            max_bytes: 2048,
            ttl: Duration::from_secs(5),
            max_flows: 65536,
        }
    }
}

#[derive(Debug)]
struct FlowState {
    buf: Vec<u8>,
    next_seq: Option<u32>,
    last_seen: Instant,
    stamp: u64,
}

/// What the tracker concluded after a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowVerdict {
    /// Keep buffering; the segment passes unmodified
    Pending,
    /// The flow does not start with a ClientHello (or can never resolve)
    NotTls,
    /// The ClientHello completed with this segment
    Resolved {
        /// Layout relative to the accumulated buffer
        layout: ClientHelloLayout,
        /// Bytes of the ClientHello carried by earlier segments
        prefix_len: usize,
    },
}

/// Per-worker table of flows awaiting a complete ClientHello
#[derive(Debug)]
pub struct FlowTracker {
    flows: HashMap<FlowKey, FlowState>,
    recency: Recency<FlowKey>,
    limits: FlowLimits,
}

impl FlowTracker {
    /// Create an empty tracker
    pub fn new(limits: FlowLimits) -> Self {
        Self {
            flows: HashMap::new(),
            recency: Recency::default(),
            limits,
        }
    }

    /// Feed one TCP payload segment
    pub fn feed(&mut self, key: FlowKey, seq: Option<u32>, payload: &[u8]) -> FlowVerdict {
        self.feed_at(key, seq, payload, Instant::now())
    }

    /// Feed one TCP payload segment with an explicit clock
    #[allow(clippy::cast_possible_truncation)]
    pub fn feed_at(
        &mut self,
        key: FlowKey,
        seq: Option<u32>,
        payload: &[u8],
        now: Instant,
    ) -> FlowVerdict {
        if payload.is_empty() {
            return FlowVerdict::Pending;
        }

        if !self.flows.contains_key(&key) {
            // First segment of the flow: most ClientHellos fit in one
            return match tls::parse_record(payload) {
                Extraction::Parsed(layout) => FlowVerdict::Resolved {
                    layout,
                    prefix_len: 0,
                },
                Extraction::NotClientHello => FlowVerdict::NotTls,
                Extraction::Incomplete => {
                    self.start(key, seq, payload, now);
                    FlowVerdict::Pending
                }
            };
        }
        let Some(state) = self.flows.get_mut(&key) else {
            return FlowVerdict::Pending;
        };

        // Retransmissions and out-of-order segments are not appended
        if let (Some(expected), Some(seq)) = (state.next_seq, seq) {
            if seq != expected {
                trace!(?key, seq, expected, "segment out of sequence, not buffered");
                state.last_seen = now;
                state.stamp = self.recency.touch(key);
                self.compact();
                return FlowVerdict::Pending;
            }
        }

        let prefix_len = state.buf.len();
        let room = self.limits.max_bytes.saturating_sub(prefix_len);
        let take = payload.len().min(room);
        state.buf.extend_from_slice(&payload[..take]);
        state.next_seq = seq.map(|s| s.wrapping_add(payload.len() as u32));
        state.last_seen = now;
        state.stamp = self.recency.touch(key);

        let verdict = match tls::parse_record(&state.buf) {
            Extraction::Parsed(layout) => FlowVerdict::Resolved { layout, prefix_len },
            Extraction::NotClientHello => FlowVerdict::NotTls,
            Extraction::Incomplete if state.buf.len() >= self.limits.max_bytes => {
                trace!(?key, "ClientHello larger than buffer limit");
                FlowVerdict::NotTls
            }
            Extraction::Incomplete => FlowVerdict::Pending,
        };

        if verdict != FlowVerdict::Pending {
            self.flows.remove(&key);
        }
        self.compact();
        verdict
    }

    #[allow(clippy::cast_possible_truncation)]
    fn start(&mut self, key: FlowKey, seq: Option<u32>, payload: &[u8], now: Instant) {
        if self.flows.len() >= self.limits.max_flows {
            self.evict_oldest();
        }
        let take = payload.len().min(self.limits.max_bytes);
        self.flows.insert(
            key,
            FlowState {
                buf: payload[..take].to_vec(),
                next_seq: seq.map(|s| s.wrapping_add(payload.len() as u32)),
                last_seen: now,
                stamp: self.recency.touch(key),
            },
        );
        self.compact();
    }

    fn evict_oldest(&mut self) {
        let flows = &self.flows;
        let oldest = self
            .recency
            .pop_oldest(|key, stamp| flows.get(key).is_some_and(|s| s.stamp == stamp));
        if let Some(key) = oldest {
            trace!(?key, "flow table full, evicting");
            self.flows.remove(&key);
        }
    }

    fn compact(&mut self) {
        let flows = &self.flows;
        self.recency.compact(flows.len(), |key, stamp| {
            flows.get(key).is_some_and(|s| s.stamp == stamp)
        });
    }

    /// Forget a flow
    pub fn remove(&mut self, key: &FlowKey) {
        self.flows.remove(key);
    }

    /// Remove flows idle longer than the TTL; returns how many
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let before = self.flows.len();
        let ttl = self.limits.ttl;
        self.flows
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= ttl);
        self.compact();
        before - self.flows.len()
    }

    /// Whether a flow is being tracked
    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Number of tracked flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flows are tracked
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ClientHelloBuilder;
    use std::net::Ipv4Addr;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)),
            src_port: port,
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            dst_port: 443,
        }
    }

    #[test]
    fn test_single_segment_resolves_without_state() {
        let mut tracker = FlowTracker::new(FlowLimits::default());
        let hello = ClientHelloBuilder::new("www.example.com").build_record();
        let verdict = tracker.feed(key(1), Some(100), &hello);
        assert!(matches!(verdict, FlowVerdict::Resolved { prefix_len: 0, .. }));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_two_segments_resolve_exactly_once() {
        let mut tracker = FlowTracker::new(FlowLimits::default());
        let hello = ClientHelloBuilder::new("www.example.com").build_record();
        let (a, b) = hello.split_at(100);

        assert_eq!(tracker.feed(key(2), Some(1), a), FlowVerdict::Pending);
        assert!(tracker.contains(&key(2)));
        let FlowVerdict::Resolved { layout, prefix_len } = tracker.feed(key(2), Some(101), b) else {
            panic!("expected resolution");
        };
        assert_eq!(prefix_len, 100);
        assert_eq!(layout.hostname.as_deref(), Some("www.example.com"));
        assert!(!tracker.contains(&key(2)));

        // A later segment starts fresh and is not TLS
        assert_eq!(tracker.feed(key(2), Some(9999), b"\x17\x03\x03\x00\x01x"), FlowVerdict::NotTls);
    }

    #[test]
    fn test_retransmission_not_appended() {
        let mut tracker = FlowTracker::new(FlowLimits::default());
        let hello = ClientHelloBuilder::new("www.example.com").build_record();
        let (a, b) = hello.split_at(50);

        tracker.feed(key(3), Some(1), a);
        assert_eq!(tracker.feed(key(3), Some(1), a), FlowVerdict::Pending);
        assert!(matches!(
            tracker.feed(key(3), Some(51), b),
            FlowVerdict::Resolved { .. }
        ));
    }

    #[test]
    fn test_non_tls_not_tracked() {
        let mut tracker = FlowTracker::new(FlowLimits::default());
        assert_eq!(tracker.feed(key(4), None, b"GET / HTTP/1.1\r\n"), FlowVerdict::NotTls);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_buffer_cap_gives_up() {
        let limits = FlowLimits {
            max_bytes: 64,
            ..FlowLimits::default()
        };
        let mut tracker = FlowTracker::new(limits);
        let hello = ClientHelloBuilder::new("www.example.com").build_record();
        assert_eq!(tracker.feed(key(5), None, &hello[..40]), FlowVerdict::Pending);
        assert_eq!(tracker.feed(key(5), None, &hello[40..]), FlowVerdict::NotTls);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_sweep_uses_injected_clock() {
        let mut tracker = FlowTracker::new(FlowLimits::default());
        let hello = ClientHelloBuilder::new("www.example.com").build_record();
        let t0 = Instant::now();
        tracker.feed_at(key(6), None, &hello[..10], t0);

        assert_eq!(tracker.sweep_at(t0 + Duration::from_secs(5)), 0);
        assert_eq!(tracker.sweep_at(t0 + Duration::from_millis(5001)), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_full_table_evicts_oldest() {
        let limits = FlowLimits {
            max_flows: 2,
            ..FlowLimits::default()
        };
        let mut tracker = FlowTracker::new(limits);
        let t0 = Instant::now();
        let partial = &ClientHelloBuilder::new("a.example").build_record()[..10];
        tracker.feed_at(key(10), None, partial, t0);
        tracker.feed_at(key(11), None, partial, t0 + Duration::from_millis(1));
        tracker.feed_at(key(12), None, partial, t0 + Duration::from_millis(2));
        assert_eq!(tracker.len(), 2);
        assert!(!tracker.contains(&key(10)));
    }

    #[test]
    fn test_full_table_evicts_least_recently_active() {
        let limits = FlowLimits {
            max_flows: 2,
            ..FlowLimits::default()
        };
        let mut tracker = FlowTracker::new(limits);
        let t0 = Instant::now();
        let hello = ClientHelloBuilder::new("a.example").build_record();
        tracker.feed_at(key(20), Some(1), &hello[..10], t0);
        tracker.feed_at(key(21), Some(1), &hello[..10], t0 + Duration::from_millis(1));
        tracker.feed_at(key(20), Some(11), &hello[10..20], t0 + Duration::from_millis(2));
        tracker.feed_at(key(22), Some(1), &hello[..10], t0 + Duration::from_millis(3));

        assert!(tracker.contains(&key(20)));
        assert!(!tracker.contains(&key(21)));
        assert!(tracker.contains(&key(22)));
    }

    #[test]
    fn test_eviction_order_stays_bounded() {
        let limits = FlowLimits {
            max_flows: 8,
            ..FlowLimits::default()
        };
        let mut tracker = FlowTracker::new(limits);
        let partial = &ClientHelloBuilder::new("a.example").build_record()[..10];
        for port in 0..10_000 {
            tracker.feed(key(port), Some(1), partial);
            // Retransmissions touch the flow without growing it
            tracker.feed(key(port), Some(1), partial);
        }
        assert_eq!(tracker.len(), 8);
        assert!(tracker.recency.queued() <= 2 * 8 + 64 + 1);
    }

    fn flood_key(i: u32) -> FlowKey {
        let [a, b, c, d] = i.to_be_bytes();
        FlowKey {
            src: IpAddr::V4(Ipv4Addr::new(10, a, b, c)),
            src_port: u16::from(d) + 1024,
            dst: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            dst_port: 443,
        }
    }

    #[test]
    fn test_inserts_at_capacity_cost_like_inserts_below_it() {
        let limits = FlowLimits::default();
        let mut tracker = FlowTracker::new(limits);
        let partial = &ClientHelloBuilder::new("a.example").build_record()[..10];
        let max = limits.max_flows as u32;

        let start = Instant::now();
        for i in 0..max {
            tracker.feed(flood_key(i), None, partial);
        }
        let fill = start.elapsed();
        assert_eq!(tracker.len(), limits.max_flows);

        let start = Instant::now();
        for i in max..max + 20_000 {
            tracker.feed(flood_key(i), None, partial);
        }
        let at_cap = start.elapsed();
        assert_eq!(tracker.len(), limits.max_flows);
        assert!(!tracker.contains(&flood_key(0)));
        assert!(tracker.contains(&flood_key(max + 19_999)));
        assert!(at_cap < fill * 4, "fill {fill:?}, 20000 at capacity {at_cap:?}");
    }
}
