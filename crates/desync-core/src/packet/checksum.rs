//! Internet checksum arithmetic (RFC 1071)
//!
//! All functions operate on raw byte slices so they can be used on packets
//! that are still being assembled.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Checksum helpers for IPv4 headers and TCP/UDP pseudo-headers
pub struct Checksum;

impl Checksum {
    /// Add `data` to a running one's-complement sum (big-endian words,
    /// odd trailing byte padded with zero)
    pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
        let mut chunks = data.chunks_exact(2);
        for word in &mut chunks {
            sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
        }
        if let [last] = chunks.remainder() {
            sum = sum.wrapping_add(u32::from(*last) << 8);
        }
        sum
    }

    /// Fold a running sum to 16 bits and complement it
    #[allow(clippy::cast_possible_truncation)]
    pub fn finish(mut sum: u32) -> u16 {
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        let folded = sum as u16;
        !folded
    }

    /// Calculate Internet Checksum (RFC 1071)
    pub fn internet(data: &[u8]) -> u16 {
        Self::finish(Self::accumulate(0, data))
    }

    /// Calculate IPv4 header checksum, ignoring the stored checksum field
    pub fn ipv4_header(header: &[u8]) -> u16 {
        if header.len() < 12 {
            return Self::internet(header);
        }
        let sum = Self::accumulate(0, &header[..10]);
        Self::finish(Self::accumulate(sum, &header[12..]))
    }

    /// Pseudo-header sum for IPv4 (src, dst, zero, proto, length)
    #[allow(clippy::cast_possible_truncation)]
    pub fn pseudo_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: usize) -> u32 {
        let mut sum = Self::accumulate(0, &src.octets());
        sum = Self::accumulate(sum, &dst.octets());
        sum = sum.wrapping_add(u32::from(proto));
        sum.wrapping_add(len as u32 & 0xFFFF)
    }

    /// Pseudo-header sum for IPv6 (src, dst, 32-bit length, zeros, next header)
    #[allow(clippy::cast_possible_truncation)]
    pub fn pseudo_v6(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, len: usize) -> u32 {
        let mut sum = Self::accumulate(0, &src.octets());
        sum = Self::accumulate(sum, &dst.octets());
        let len = len as u32;
        sum = Self::accumulate(sum, &len.to_be_bytes());
        sum.wrapping_add(u32::from(proto))
    }

    /// TCP/UDP checksum over an IPv4 pseudo-header and the full segment.
    /// The segment's own checksum field must be zeroed by the caller.
    pub fn transport_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
        let sum = Self::pseudo_v4(src, dst, proto, segment.len());
        Self::finish(Self::accumulate(sum, segment))
    }

    /// TCP/UDP checksum over an IPv6 pseudo-header and the full segment.
    /// The segment's own checksum field must be zeroed by the caller.
    pub fn transport_v6(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, segment: &[u8]) -> u16 {
        let sum = Self::pseudo_v6(src, dst, proto, segment.len());
        Self::finish(Self::accumulate(sum, segment))
    }

    /// Verify a segment that already carries its checksum: the folded sum
    /// over pseudo-header plus segment is zero when it is correct
    pub fn verify_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> bool {
        Self::transport_v4(src, dst, proto, segment) == 0
    }

    /// IPv6 counterpart of [`Checksum::verify_v4`]
    pub fn verify_v6(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, segment: &[u8]) -> bool {
        Self::transport_v6(src, dst, proto, segment) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internet_checksum_rfc1071() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(Checksum::internet(&data), 0x220d);
    }

    #[test]
    fn test_internet_checksum_empty() {
        assert_eq!(Checksum::internet(&[]), 0xFFFF);
    }

    #[test]
    fn test_odd_length_pads_with_zero() {
        assert_eq!(
            Checksum::internet(&[0x12, 0x34, 0x56]),
            Checksum::internet(&[0x12, 0x34, 0x56, 0x00])
        );
    }

    #[test]
    fn test_all_ones() {
        assert_eq!(Checksum::internet(&[0xFF, 0xFF, 0xFF, 0xFF]), 0x0000);
    }

    #[test]
    fn test_ipv4_header_checksum_ignores_stored_field() {
        let mut header = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];
        assert_eq!(Checksum::ipv4_header(&header), 0xb1e6);

        header[10] = 0xde;
        header[11] = 0xad;
        assert_eq!(Checksum::ipv4_header(&header), 0xb1e6);
    }

    #[test]
    fn test_header_with_checksum_sums_to_zero() {
        let header = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0xb1, 0xe6, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];
        assert_eq!(Checksum::internet(&header), 0x0000);
    }

    #[test]
    fn test_transport_v4_roundtrip_verifies() {
        let src = Ipv4Addr::new(192, 168, 1, 1);
        let dst = Ipv4Addr::new(192, 168, 1, 2);
        let mut segment = vec![
            0x30, 0x39, 0x01, 0xbb, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x50, 0x02,
            0x72, 0x10, 0x00, 0x00, 0x00, 0x00, b'h', b'i', b'!',
        ];
        let sum = Checksum::transport_v4(src, dst, 6, &segment);
        segment[16..18].copy_from_slice(&sum.to_be_bytes());
        assert!(Checksum::verify_v4(src, dst, 6, &segment));

        segment[20] ^= 0x01;
        assert!(!Checksum::verify_v4(src, dst, 6, &segment));
    }

    #[test]
    fn test_transport_v6_roundtrip_verifies() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut segment = vec![0x00, 0x35, 0x01, 0xbb, 0x00, 0x0b, 0x00, 0x00, 1, 2, 3];
        let sum = Checksum::transport_v6(src, dst, 17, &segment);
        segment[6..8].copy_from_slice(&sum.to_be_bytes());
        assert!(Checksum::verify_v6(src, dst, 17, &segment));
    }
}
