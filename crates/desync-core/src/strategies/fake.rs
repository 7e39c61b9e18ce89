//! Fake packet injection
//!
//! Decoys travel on the real flow but never reach the server's stack: they
//! run out of TTL on the way, carry a broken checksum, or sit at a sequence
//! number the server will ignore. A DPI box that accepts them sees a
//! ClientHello for an allowed host first.

use crate::config::{FakeConfig, FakePayloadKind, SeqStrategy};
use crate::error::{Error, Result};
use crate::packet::{Packet, TcpFlags};
use crate::quic::QUIC_V1;
use crate::tls::ClientHelloBuilder;
use rand::Rng;
use tracing::trace;

/// Bytes of a fake built for `kind`. `len_hint` sizes random payloads.
pub fn fake_payload(cfg: &FakeConfig, custom: Option<&[u8]>, len_hint: usize) -> Result<Vec<u8>> {
    match cfg.payload {
        FakePayloadKind::Default1 => Ok(ClientHelloBuilder::new(&cfg.decoy_host)
            .alpn(false)
            .build_record()),
        FakePayloadKind::Default2 => Ok(ClientHelloBuilder::new(&cfg.decoy_host)
            .randomized()
            .build_record()),
        FakePayloadKind::Random => {
            let mut bytes = vec![0u8; len_hint.clamp(64, 1400)];
            rand::thread_rng().fill(bytes.as_mut_slice());
            // Keep the record header so the DPI treats it as TLS
            bytes[..3].copy_from_slice(&[0x16, 0x03, 0x01]);
            Ok(bytes)
        }
        FakePayloadKind::Custom => custom
            .filter(|c| !c.is_empty())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::precondition("fake", "custom payload not configured")),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn place(fake: &mut Packet, real_seq: u32, strategy: SeqStrategy, fake_len: usize) {
    let seq = match strategy {
        SeqStrategy::PastSeq => real_seq.wrapping_sub(fake_len as u32),
        SeqStrategy::RandSeq => real_seq.wrapping_add(rand::thread_rng().gen_range(0x0001_0000..0x4000_0000)),
        SeqStrategy::Ttl => real_seq,
    };
    fake.set_tcp_seq(seq);
}

/// Fake data segments for the real segment `packet`
pub fn fake_segments(packet: &Packet, cfg: &FakeConfig, custom: Option<&[u8]>) -> Result<Vec<Packet>> {
    let real_seq = packet
        .tcp_seq()
        .ok_or_else(|| Error::precondition("fake", "not a TCP segment"))?;
    let payload = fake_payload(cfg, custom, packet.payload_len())?;

    let mut out = Vec::with_capacity(usize::from(cfg.repeat));
    for _ in 0..cfg.repeat {
        let mut fake = packet.with_payload(&payload)?;
        fake.set_ttl(cfg.ttl);
        place(&mut fake, real_seq, cfg.seq_strategy, payload.len());
        fake.fix_checksums();
        if cfg.bad_checksum {
            fake.corrupt_checksum();
        }
        out.push(fake);
    }
    trace!(count = out.len(), ttl = cfg.ttl, seq = ?cfg.seq_strategy, "built fake segments");
    Ok(out)
}

/// Fake UDP datagrams shaped like a QUIC Initial for the real datagram
pub fn fake_datagrams(packet: &Packet, cfg: &FakeConfig) -> Result<Vec<Packet>> {
    if !packet.is_udp() {
        return Err(Error::precondition("fake", "not a UDP datagram"));
    }
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(usize::from(cfg.repeat));
    for _ in 0..cfg.repeat {
        let mut payload = vec![0u8; packet.payload_len().max(64)];
        rng.fill(payload.as_mut_slice());
        // Long header, Initial, version 1
        payload[0] = 0xC0 | (payload[0] & 0x0F);
        payload[1..5].copy_from_slice(&QUIC_V1.to_be_bytes());
        let mut fake = packet.with_payload(&payload)?;
        fake.set_ttl(cfg.ttl);
        fake.fix_checksums();
        if cfg.bad_checksum {
            fake.corrupt_checksum();
        }
        out.push(fake);
    }
    Ok(out)
}

/// Decoy SYNs carrying a fake payload, sent ahead of the real SYN
pub fn syn_fakes(syn: &Packet, cfg: &FakeConfig, custom: Option<&[u8]>) -> Result<Vec<Packet>> {
    if !syn.is_syn() {
        return Err(Error::precondition("syn_fake", "not a SYN"));
    }
    let payload = fake_payload(cfg, custom, 0)?;

    let mut out = Vec::with_capacity(usize::from(cfg.repeat));
    for _ in 0..cfg.repeat {
        let mut fake = syn.with_payload(&payload)?;
        fake.set_ttl(cfg.ttl);
        fake.set_tcp_flags(TcpFlags::syn());
        fake.fix_checksums();
        if cfg.bad_checksum {
            fake.corrupt_checksum();
        }
        out.push(fake);
    }
    Ok(out)
}
