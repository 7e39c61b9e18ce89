use criterion::{black_box, criterion_group, criterion_main, Criterion};
use desync_core::config::{CompiledSet, StrategyFamily};
use desync_core::packet::{Direction, Packet, PacketBuilder, TcpFlags};
use desync_core::quic::{QuicExtractor, ReassemblyLimits};
use desync_core::strategies::plan_client_hello;
use desync_core::tls::{parse_record, ClientHelloBuilder, Extraction};

fn hello_packet() -> Packet {
    let record = ClientHelloBuilder::new("www.blocked.example").build_record();
    let bytes = PacketBuilder::tcp_v4()
        .src_ip_v4([192, 168, 1, 100])
        .dst_ip_v4([93, 184, 216, 34])
        .dst_port(443)
        .flags(TcpFlags::data())
        .payload(&record)
        .build();
    Packet::from_bytes(&bytes, Direction::Outbound).expect("valid packet")
}

fn bench_parse_record(c: &mut Criterion) {
    let record = ClientHelloBuilder::new("www.blocked.example").build_record();
    c.bench_function("tls parse_record", |b| {
        b.iter(|| parse_record(black_box(&record)));
    });
}

fn bench_quic_plaintext_initial(c: &mut Criterion) {
    let handshake = ClientHelloBuilder::new("quic.blocked.example").build_handshake();
    let mut frame = vec![0x06, 0x00];
    frame.extend_from_slice(&(0x4000u16 | u16::try_from(handshake.len()).expect("fits")).to_be_bytes());
    frame.extend_from_slice(&handshake);

    let mut datagram = vec![0xC0, 0x00, 0x00, 0x00, 0x01, 8];
    datagram.extend_from_slice(&[0x5A; 8]);
    datagram.extend_from_slice(&[0, 0]);
    let length = u16::try_from(frame.len() + 1).expect("fits");
    datagram.extend_from_slice(&(0x4000 | length).to_be_bytes());
    datagram.push(0);
    datagram.extend_from_slice(&frame);

    c.bench_function("quic feed single initial", |b| {
        let mut extractor = QuicExtractor::new(ReassemblyLimits::default(), false);
        b.iter(|| extractor.feed(black_box(&datagram)));
    });
}

fn bench_plan_client_hello(c: &mut Criterion) {
    let packet = hello_packet();
    let Extraction::Parsed(layout) = parse_record(packet.payload()) else {
        panic!("expected ClientHello");
    };
    let set = CompiledSet {
        name: "bench".into(),
        evasion: StrategyFamily::Hybrid.into_config(),
        custom_fake: None,
    };
    c.bench_function("plan_client_hello hybrid", |b| {
        b.iter(|| plan_client_hello(black_box(&packet), Some(&layout), &set));
    });
}

criterion_group!(
    benches,
    bench_parse_record,
    bench_quic_plaintext_initial,
    bench_plan_client_hello
);
criterion_main!(benches);
