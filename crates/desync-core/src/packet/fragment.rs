//! IP-layer fragmentation
//!
//! Splits a complete datagram into fragments at 8-byte aligned offsets of
//! the IP payload. The transport checksum must already be final: it is
//! computed over the whole datagram and fragments only carry slices of it.

use super::{ipproto, Packet, IPV6_FRAGMENT_HEADER, IPV6_HEADER};
use crate::error::{Error, Result};
use bytes::BytesMut;

fn check_offsets(offsets: &[usize], payload_len: usize) -> Result<()> {
    let mut last = 0;
    for &off in offsets {
        if off == 0 || off % 8 != 0 || off <= last || off >= payload_len {
            return Err(Error::precondition(
                "ip_frag",
                format!("invalid fragment offset {off} for {payload_len} byte payload"),
            ));
        }
        last = off;
    }
    Ok(())
}

fn bounds(offsets: &[usize], payload_len: usize) -> Vec<(usize, usize)> {
    let mut starts = Vec::with_capacity(offsets.len() + 1);
    starts.push(0);
    starts.extend_from_slice(offsets);
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| (start, starts.get(i + 1).copied().unwrap_or(payload_len)))
        .collect()
}

/// Fragment offsets for sending `total_len` bytes through `mtu`
pub fn mtu_offsets(total_len: usize, ip_header_len: usize, mtu: usize) -> Vec<usize> {
    let payload_len = total_len.saturating_sub(ip_header_len);
    let step = (mtu.saturating_sub(ip_header_len) / 8) * 8;
    if step == 0 || total_len <= mtu {
        return Vec::new();
    }
    (1..).map(|i| i * step).take_while(|&o| o < payload_len).collect()
}

/// Split an IPv4 datagram at the given IP-payload offsets. All fragments
/// share the datagram's identification; every fragment but the last has MF.
#[allow(clippy::cast_possible_truncation)]
pub fn fragment_ipv4(packet: &Packet, offsets: &[usize]) -> Result<Vec<Packet>> {
    if !packet.is_ipv4() || packet.is_fragment {
        return Err(Error::precondition("ip_frag", "not an unfragmented IPv4 datagram"));
    }
    let ihl = packet.ip_header_len();
    let data = packet.as_bytes();
    let payload = &data[ihl..];
    check_offsets(offsets, payload.len())?;

    let pieces = bounds(offsets, payload.len());
    let count = pieces.len();
    let mut out = Vec::with_capacity(count);
    for (i, (start, end)) in pieces.into_iter().enumerate() {
        let mut buf = BytesMut::with_capacity(ihl + end - start);
        buf.extend_from_slice(&data[..ihl]);
        buf.extend_from_slice(&payload[start..end]);

        let more = if i + 1 < count { 0x2000 } else { 0 };
        let field = more | ((start / 8) as u16 & 0x1FFF);
        buf[6..8].copy_from_slice(&field.to_be_bytes());
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_be_bytes());

        let mut frag = packet.rebuilt(buf)?;
        frag.fix_checksums();
        out.push(frag);
    }
    Ok(out)
}

/// Split an IPv6 datagram at the given payload offsets by inserting a
/// Fragment extension header (next header 44) carrying `id`.
#[allow(clippy::cast_possible_truncation)]
pub fn fragment_ipv6(packet: &Packet, offsets: &[usize], id: u32) -> Result<Vec<Packet>> {
    if !packet.is_ipv6() || packet.is_fragment {
        return Err(Error::precondition("ip_frag", "not an unfragmented IPv6 datagram"));
    }
    let data = packet.as_bytes();
    let next_header = data[6];
    let payload = &data[IPV6_HEADER..];
    check_offsets(offsets, payload.len())?;

    let pieces = bounds(offsets, payload.len());
    let count = pieces.len();
    let mut out = Vec::with_capacity(count);
    for (i, (start, end)) in pieces.into_iter().enumerate() {
        let mut buf = BytesMut::with_capacity(IPV6_HEADER + IPV6_FRAGMENT_HEADER + end - start);
        buf.extend_from_slice(&data[..IPV6_HEADER]);
        buf[6] = ipproto::IPV6_FRAGMENT;

        let more = u16::from(i + 1 < count);
        let field = ((start / 8) as u16) << 3 | more;
        buf.extend_from_slice(&[next_header, 0]);
        buf.extend_from_slice(&field.to_be_bytes());
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&payload[start..end]);

        let payload_len = (buf.len() - IPV6_HEADER) as u16;
        buf[4..6].copy_from_slice(&payload_len.to_be_bytes());
        out.push(packet.rebuilt(buf)?);
    }
    Ok(out)
}
