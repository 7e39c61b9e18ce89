//! Integration tests for connection tracking

use desync_core::conntrack::{
    DnsConnTracker, FlowKey, FlowLimits, FlowTracker, FlowVerdict, OriginalDestination, QueryKey,
};
use desync_core::tls::ClientHelloBuilder;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

fn key(src_port: u16) -> FlowKey {
    FlowKey {
        src: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
        src_port,
        dst: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        dst_port: 443,
    }
}

// ============ Flow Tracker Tests ============

#[test]
fn test_single_segment_resolves_without_state() {
    let mut tracker = FlowTracker::new(FlowLimits::default());
    let record = ClientHelloBuilder::new("example.com").build_record();

    match tracker.feed(key(50000), Some(1), &record) {
        FlowVerdict::Resolved { layout, prefix_len } => {
            assert_eq!(layout.hostname.as_deref(), Some("example.com"));
            assert_eq!(prefix_len, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(tracker.is_empty());
}

#[test]
fn test_three_segments_resolve_once() {
    let mut tracker = FlowTracker::new(FlowLimits::default());
    let record = ClientHelloBuilder::new("www.example.org").build_record();
    let third = record.len() / 3;
    let now = Instant::now();

    assert_eq!(tracker.feed_at(key(50001), Some(10), &record[..third], now), FlowVerdict::Pending);
    assert_eq!(
        tracker.feed_at(key(50001), Some(10 + third as u32), &record[third..2 * third], now),
        FlowVerdict::Pending
    );
    let verdict = tracker.feed_at(
        key(50001),
        Some(10 + 2 * third as u32),
        &record[2 * third..],
        now,
    );
    let FlowVerdict::Resolved { layout, prefix_len } = verdict else {
        panic!("expected resolution, got {verdict:?}");
    };
    assert_eq!(prefix_len, 2 * third);
    assert_eq!(layout.hostname.as_deref(), Some("www.example.org"));
    assert!(!tracker.contains(&key(50001)));
}

#[test]
fn test_non_tls_flow_not_tracked() {
    let mut tracker = FlowTracker::new(FlowLimits::default());
    let verdict = tracker.feed(key(50002), Some(1), b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(verdict, FlowVerdict::NotTls);
    assert!(tracker.is_empty());
}

#[test]
fn test_oversized_hello_abandoned_at_limit() {
    let limits = FlowLimits {
        max_bytes: 64,
        ..FlowLimits::default()
    };
    let mut tracker = FlowTracker::new(limits);
    let record = ClientHelloBuilder::new("example.com").build_record();

    assert_eq!(tracker.feed(key(50003), Some(0), &record[..40]), FlowVerdict::Pending);
    assert_eq!(tracker.feed(key(50003), Some(40), &record[40..100]), FlowVerdict::NotTls);
    assert!(tracker.is_empty());
}

#[test]
fn test_sweep_with_synthetic_clock() {
    let mut tracker = FlowTracker::new(FlowLimits::default());
    let record = ClientHelloBuilder::new("example.com").build_record();
    let start = Instant::now();

    tracker.feed_at(key(1), Some(0), &record[..10], start);
    tracker.feed_at(key(2), Some(0), &record[..10], start + Duration::from_secs(3));
    assert_eq!(tracker.len(), 2);

    // key(1) idle 5.5 s, key(2) idle 2.5 s
    assert_eq!(tracker.sweep_at(start + Duration::from_millis(5500)), 1);
    assert!(!tracker.contains(&key(1)));
    assert!(tracker.contains(&key(2)));

    assert_eq!(tracker.sweep_at(start + Duration::from_secs(9)), 1);
    assert!(tracker.is_empty());
}

#[test]
fn test_full_table_evicts_oldest() {
    let limits = FlowLimits {
        max_flows: 2,
        ..FlowLimits::default()
    };
    let mut tracker = FlowTracker::new(limits);
    let record = ClientHelloBuilder::new("example.com").build_record();
    let start = Instant::now();

    tracker.feed_at(key(1), Some(0), &record[..10], start);
    tracker.feed_at(key(2), Some(0), &record[..10], start + Duration::from_millis(10));
    tracker.feed_at(key(3), Some(0), &record[..10], start + Duration::from_millis(20));

    assert_eq!(tracker.len(), 2);
    assert!(!tracker.contains(&key(1)));
    assert!(tracker.contains(&key(3)));
}

// ============ DNS Connection Tracker Tests ============

#[test]
fn test_dns_tracker_take_once() {
    let tracker = DnsConnTracker::new();
    let query = QueryKey {
        client_port: 53000,
        txid: 0x1234,
    };
    let original = OriginalDestination {
        addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
        port: 53,
    };

    tracker.track_query(query, original);
    assert_eq!(tracker.take_original(query), Some(original));
    assert_eq!(tracker.take_original(query), None);
}

#[test]
fn test_dns_tracker_ipv6_and_txid_isolation() {
    let tracker = DnsConnTracker::new();
    let original = OriginalDestination {
        addr: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x53)),
        port: 53,
    };
    tracker.track_query(
        QueryKey {
            client_port: 40000,
            txid: 1,
        },
        original,
    );

    let other_txid = QueryKey {
        client_port: 40000,
        txid: 2,
    };
    assert_eq!(tracker.take_original(other_txid), None);
    assert_eq!(tracker.len(), 1);
}

#[test]
fn test_dns_tracker_expiration() {
    let tracker = DnsConnTracker::with_timeout(Duration::from_millis(50));
    let query = QueryKey {
        client_port: 53001,
        txid: 7,
    };
    let original = OriginalDestination {
        addr: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        port: 53,
    };
    let start = Instant::now();

    tracker.track_query_at(query, original, start);
    assert_eq!(tracker.take_original_at(query, start + Duration::from_millis(100)), None);

    tracker.track_query_at(query, original, start);
    assert_eq!(tracker.sweep_at(start + Duration::from_millis(100)), 1);
    assert!(tracker.is_empty());
}
