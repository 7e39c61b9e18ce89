//! Fragmentation strategies
//!
//! Every strategy turns the one segment that completes a ClientHello into
//! an ordered list of [`Emit`]s. TCP pieces keep the 4-tuple; a piece that
//! starts `n` bytes into the payload has its sequence number advanced by
//! `n`, and only the piece holding the highest sequence range carries PSH.

use super::{fake, Emit};
use crate::config::{EvasionConfig, FragStrategy, ShuffleMode, TimingConfig};
use crate::error::{Error, Result};
use crate::packet::{fragment_ipv4, fragment_ipv6, Packet};
use crate::tls::{ClientHelloLayout, RECORD_HEADER_LEN};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tracing::instrument;

/// Inputs shared by all strategies
#[derive(Debug, Clone, Copy)]
pub struct SplitInput<'a> {
    /// The real segment
    pub packet: &'a Packet,
    /// ClientHello layout relative to `packet`'s payload
    pub layout: Option<&'a ClientHelloLayout>,
    /// Parameters
    pub evasion: &'a EvasionConfig,
    /// Decoded custom fake payload (combo decoys)
    pub custom_fake: Option<&'a [u8]>,
}

/// Run `strategy` on the input
#[instrument(level = "trace", skip(input), fields(strategy = strategy.name()))]
pub fn apply(strategy: FragStrategy, input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    match strategy {
        FragStrategy::None => Ok(vec![Emit::now(input.packet.clone())]),
        FragStrategy::TcpFrag => tcp_frag(input),
        FragStrategy::IpFrag => ip_frag(input),
        FragStrategy::TlsRecordSplit => tls_record_split(input),
        FragStrategy::Oob => oob(input),
        FragStrategy::Overlap => overlap(input),
        FragStrategy::Disorder => disorder(input),
        FragStrategy::Combo => combo(input),
        FragStrategy::ExtensionSplit => extension_split(input),
    }
}

/// TCP split at `position` with no other options
pub fn tcp_split_at(packet: &Packet, position: usize) -> Result<Vec<Emit>> {
    let (a, b) = tcp_pair(packet, position)?;
    Ok(vec![Emit::now(a), Emit::now(b)])
}

fn segment_delay(timing: &TimingConfig) -> Duration {
    Duration::from_millis(timing.segment_delay_ms)
}

fn jitter(timing: &TimingConfig) -> Duration {
    let us = if timing.jitter_max_us > timing.jitter_min_us {
        rand::thread_rng().gen_range(timing.jitter_min_us..=timing.jitter_max_us)
    } else {
        timing.jitter_min_us
    };
    Duration::from_micros(us)
}

/// Payload bytes `start..end` as their own segment
#[allow(clippy::cast_possible_truncation)]
fn segment(packet: &Packet, start: usize, end: usize, last: bool) -> Result<Packet> {
    let seq = packet
        .tcp_seq()
        .ok_or_else(|| Error::precondition("segment", "not a TCP segment"))?;
    let mut piece = packet.with_payload(&packet.payload()[start..end])?;
    piece.set_tcp_seq(seq.wrapping_add(start as u32));
    piece.set_psh(last);
    piece.fix_checksums();
    Ok(piece)
}

fn tcp_pair(packet: &Packet, at: usize) -> Result<(Packet, Packet)> {
    let len = packet.payload_len();
    if !packet.is_tcp() {
        return Err(Error::precondition("tcp_frag", "not a TCP segment"));
    }
    if at == 0 || at >= len {
        return Err(Error::precondition(
            "tcp_frag",
            format!("split position {at} outside payload of {len} bytes"),
        ));
    }
    Ok((segment(packet, 0, at, false)?, segment(packet, at, len, true)?))
}

fn ordered_pair(first: Packet, second: Packet, reverse: bool, delay: Duration) -> Vec<Emit> {
    let (a, b) = if reverse { (second, first) } else { (first, second) };
    vec![Emit::now(a), Emit::after(b, delay)]
}

fn split_point(input: &SplitInput<'_>) -> Result<usize> {
    let frag = &input.evasion.fragmentation;
    if frag.middle_sni {
        return input
            .layout
            .and_then(|l| l.sni)
            .map(|sni| sni.midpoint())
            .ok_or_else(|| Error::precondition("split", "SNI not locatable"));
    }
    Ok(frag.position)
}

fn tcp_frag(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let at = split_point(input)?;
    let (a, b) = tcp_pair(input.packet, at)?;
    let frag = &input.evasion.fragmentation;
    Ok(ordered_pair(a, b, frag.reverse, segment_delay(&input.evasion.timing)))
}

#[allow(clippy::cast_possible_truncation)]
fn oob(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let at = split_point(input)?;
    let (mut a, b) = tcp_pair(input.packet, at)?;
    let pointer = u16::try_from(at)
        .map_err(|_| Error::precondition("oob", "split beyond urgent pointer range"))?;
    a.set_urgent(pointer);
    a.fix_checksums();
    let frag = &input.evasion.fragmentation;
    Ok(ordered_pair(a, b, frag.reverse, segment_delay(&input.evasion.timing)))
}

fn ip_frag(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let packet = input.packet;
    let at = split_point(input)?;
    let ip_payload_len = packet.len() - packet.ip_header_len();
    let offset = ((packet.transport_header_len() + at) / 8 * 8).max(8);
    if offset >= ip_payload_len {
        return Err(Error::precondition(
            "ip_frag",
            format!("fragment offset {offset} outside {ip_payload_len} byte IP payload"),
        ));
    }

    let mut frags = if packet.is_ipv4() {
        fragment_ipv4(packet, &[offset])?
    } else {
        fragment_ipv6(packet, &[offset], rand::random())?
    };
    let second = frags.pop();
    let first = frags.pop();
    match (first, second) {
        (Some(a), Some(b)) => Ok(ordered_pair(
            a,
            b,
            input.evasion.fragmentation.reverse,
            segment_delay(&input.evasion.timing),
        )),
        _ => Err(Error::precondition("ip_frag", "expected two fragments")),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn tls_record_split(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let layout = input
        .layout
        .filter(|l| l.is_whole())
        .ok_or_else(|| Error::precondition("tls_record_split", "no whole TLS record in segment"))?;
    let payload = input.packet.payload();
    if layout.end > payload.len() {
        return Err(Error::precondition("tls_record_split", "record extends past segment"));
    }
    let body_len = layout.end - RECORD_HEADER_LEN;
    let at = match input.evasion.fragmentation.record_split_position {
        Some(at) => at,
        None => layout
            .server_name_extension()
            .map(|ext| ext.start - RECORD_HEADER_LEN)
            .ok_or_else(|| Error::precondition("tls_record_split", "no server_name extension"))?,
    };
    if at == 0 || at >= body_len {
        return Err(Error::precondition(
            "tls_record_split",
            format!("record split {at} outside {body_len} byte record body"),
        ));
    }

    let body = &payload[RECORD_HEADER_LEN..layout.end];
    let mut split = Vec::with_capacity(payload.len() + RECORD_HEADER_LEN);
    for part in [&body[..at], &body[at..]] {
        split.extend_from_slice(&payload[..3]);
        split.extend_from_slice(&(part.len() as u16).to_be_bytes());
        split.extend_from_slice(part);
    }
    split.extend_from_slice(&payload[layout.end..]);

    let rewritten = input.packet.with_payload(&split)?;
    let (a, b) = tcp_pair(&rewritten, RECORD_HEADER_LEN + at)?;
    Ok(ordered_pair(
        a,
        b,
        input.evasion.fragmentation.reverse,
        segment_delay(&input.evasion.timing),
    ))
}

fn extension_split(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let at = input
        .layout
        .and_then(ClientHelloLayout::server_name_extension)
        .map(|ext| ext.start)
        .ok_or_else(|| Error::precondition("extension_split", "no server_name extension"))?;
    let (a, b) = tcp_pair(input.packet, at)?;
    Ok(ordered_pair(
        a,
        b,
        input.evasion.fragmentation.reverse,
        segment_delay(&input.evasion.timing),
    ))
}

/// A hostname of exactly `len` bytes derived from `decoy`
pub(crate) fn fit_decoy(decoy: &str, len: usize) -> Vec<u8> {
    let decoy = decoy.as_bytes();
    if decoy.len() >= len {
        let mut out = decoy[decoy.len() - len..].to_vec();
        if let Some(first) = out.first_mut() {
            if *first == b'.' {
                *first = b'w';
            }
        }
        return out;
    }
    let pad = len - decoy.len();
    let mut out = vec![b'w'; pad];
    if pad > 1 {
        out[pad - 1] = b'.';
    }
    out.extend_from_slice(decoy);
    out
}

fn overlap(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let sni = input
        .layout
        .and_then(|l| l.sni)
        .ok_or_else(|| Error::precondition("overlap", "SNI not locatable"))?;
    let packet = input.packet;
    let payload = packet.payload();
    if sni.host_end() > payload.len() {
        return Err(Error::precondition("overlap", "SNI extends past segment"));
    }

    let mut decoy_payload = payload[..sni.host_end()].to_vec();
    let decoy = fit_decoy(&input.evasion.fragmentation.overlap_decoy, sni.host_len);
    decoy_payload[sni.host_start..sni.host_end()].copy_from_slice(&decoy);

    let mut first = packet.with_payload(&decoy_payload)?;
    first.set_psh(false);
    first.fix_checksums();
    let mut second = packet.clone();
    second.set_psh(true);
    second.fix_checksums();

    Ok(ordered_pair(
        first,
        second,
        input.evasion.fragmentation.reverse,
        segment_delay(&input.evasion.timing),
    ))
}

/// Split points for disorder and combo, sorted and inside the payload
fn candidate_points(input: &SplitInput<'_>) -> Vec<usize> {
    let len = input.packet.payload_len();
    let mut points = vec![1];
    if let Some(layout) = input.layout {
        if let Some(ext) = layout.server_name_extension() {
            points.push(ext.start);
        }
        if let Some(sni) = layout.sni {
            points.push(sni.midpoint());
        }
    }
    points.extend(input.evasion.fragmentation.extra_positions.iter().copied());
    points.retain(|&p| p > 0 && p < len);
    points.sort_unstable();
    points.dedup();
    points
}

fn pieces(packet: &Packet, points: &[usize]) -> Result<Vec<Packet>> {
    let len = packet.payload_len();
    let mut bounds = Vec::with_capacity(points.len() + 2);
    bounds.push(0);
    bounds.extend_from_slice(points);
    bounds.push(len);
    bounds
        .windows(2)
        .map(|w| segment(packet, w[0], w[1], w[1] == len))
        .collect()
}

/// Send order of `n` pieces (indices in sequence order)
fn shuffle_order(n: usize, mode: ShuffleMode) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = rand::thread_rng();
    match mode {
        ShuffleMode::Random => order.shuffle(&mut rng),
        ShuffleMode::Reverse => order.reverse(),
        ShuffleMode::MiddleRandom => {
            if n > 2 {
                order[1..n - 1].shuffle(&mut rng);
            }
        }
    }
    order
}

fn multi_pieces(input: &SplitInput<'_>, strategy: &'static str) -> Result<Vec<Packet>> {
    if !input.packet.is_tcp() {
        return Err(Error::precondition(strategy, "not a TCP segment"));
    }
    let points = candidate_points(input);
    if points.len() < 2 {
        return Err(Error::precondition(strategy, "fewer than three pieces available"));
    }
    pieces(input.packet, &points)
}

fn disorder(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let mut pieces: Vec<Option<Packet>> =
        multi_pieces(input, "disorder")?.into_iter().map(Some).collect();
    let order = shuffle_order(pieces.len(), input.evasion.fragmentation.shuffle);
    let timing = &input.evasion.timing;

    let mut out = Vec::with_capacity(pieces.len());
    for (n, i) in order.into_iter().enumerate() {
        if let Some(piece) = pieces[i].take() {
            let delay = if n == 0 { Duration::ZERO } else { jitter(timing) };
            out.push(Emit::after(piece, delay));
        }
    }
    Ok(out)
}

fn combo(input: &SplitInput<'_>) -> Result<Vec<Emit>> {
    let mut pieces: Vec<Option<Packet>> =
        multi_pieces(input, "combo")?.into_iter().map(Some).collect();
    let frag = &input.evasion.fragmentation;
    let timing = &input.evasion.timing;

    // The first piece always leads; the rest follow in shuffled order
    let mut order = vec![0];
    order.extend(shuffle_order(pieces.len() - 1, frag.shuffle).into_iter().map(|i| i + 1));

    let mut out = Vec::new();
    for (n, i) in order.into_iter().enumerate() {
        let Some(piece) = pieces[i].take() else {
            continue;
        };
        let mut delay = match n {
            0 => Duration::ZERO,
            1 => Duration::from_millis(frag.combo_pause_ms),
            _ => jitter(timing),
        };
        if frag.combo_decoys {
            for decoy in fake::fake_segments(&piece, &input.evasion.fake, input.custom_fake)? {
                out.push(Emit::after(decoy, delay));
                delay = Duration::ZERO;
            }
        }
        out.push(Emit::after(piece, delay));
    }
    Ok(out)
}
