//! Packet parsing and manipulation
//!
//! Low-level packet handling for TCP/IP traffic. A [`Packet`] owns its bytes
//! and carries a header view derived from them. Every operation that changes
//! the packet's size rebuilds the view by parsing the new buffer again.

mod builder;
mod checksum;
mod fragment;
mod types;

pub use builder::PacketBuilder;
pub use checksum::Checksum;
pub use fragment::{fragment_ipv4, fragment_ipv6, mtu_offsets};
pub use types::*;

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum packet size we handle
pub const MAX_PACKET_SIZE: usize = 9016;

/// Maximum hostname length (DNS standard)
pub const MAX_HOSTNAME_LEN: usize = 253;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const IPV6_FRAGMENT_HEADER: usize = 8;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

/// Represents a network packet with parsed headers
#[derive(Debug, Clone)]
pub struct Packet {
    /// Raw packet data
    data: BytesMut,
    /// Packet direction
    pub direction: Direction,
    /// IP version
    pub ip_version: IpVersion,
    /// Transport protocol
    pub protocol: Protocol,
    /// Source IP address
    pub src_addr: IpAddr,
    /// Destination IP address
    pub dst_addr: IpAddr,
    /// Source port (TCP/UDP)
    pub src_port: u16,
    /// Destination port (TCP/UDP)
    pub dst_port: u16,
    /// IP header length (including an IPv6 fragment header)
    ip_header_len: usize,
    /// Transport header length
    transport_header_len: usize,
    /// TCP flags (if TCP)
    pub tcp_flags: Option<TcpFlags>,
    /// TTL/Hop Limit
    pub ttl: u8,
    /// IP ID (IPv4 only)
    pub ip_id: Option<u16>,
    /// Packet is an IP fragment; transport fields are not parsed
    pub is_fragment: bool,
}

impl Packet {
    /// Create a new packet from raw bytes
    pub fn from_bytes(data: &[u8], direction: Direction) -> Result<Self> {
        Self::from_buf(BytesMut::from(data), direction)
    }

    fn from_buf(data: BytesMut, direction: Direction) -> Result<Self> {
        if data.len() < IPV4_MIN_HEADER {
            return Err(Error::PacketTooSmall {
                expected: IPV4_MIN_HEADER,
                actual: data.len(),
            });
        }

        let mut packet = Self {
            data,
            direction,
            ip_version: IpVersion::V4,
            protocol: Protocol::Other(0),
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            ip_header_len: 0,
            transport_header_len: 0,
            tcp_flags: None,
            ttl: 0,
            ip_id: None,
            is_fragment: false,
        };

        packet.parse()?;
        Ok(packet)
    }

    /// Rebuild a packet from new bytes, keeping the direction
    fn rebuilt(&self, data: BytesMut) -> Result<Self> {
        Self::from_buf(data, self.direction)
    }

    fn parse(&mut self) -> Result<()> {
        let version = (self.data[0] >> 4) & 0x0F;

        match version {
            4 => self.parse_ipv4()?,
            6 => self.parse_ipv6()?,
            _ => return Err(Error::packet_parse(format!("Unknown IP version: {version}"))),
        }

        Ok(())
    }

    fn parse_ipv4(&mut self) -> Result<()> {
        self.ip_version = IpVersion::V4;
        self.ip_header_len = usize::from(self.data[0] & 0x0F) * 4;

        if self.ip_header_len < IPV4_MIN_HEADER {
            return Err(Error::packet_parse_at("IPv4 IHL below minimum", 0));
        }

        let total_len = usize::from(u16::from_be_bytes([self.data[2], self.data[3]]));
        if total_len < self.ip_header_len || total_len > self.data.len() {
            return Err(Error::packet_parse_at(
                format!("IPv4 total length {total_len} does not match buffer {}", self.data.len()),
                2,
            ));
        }
        // Link-layer padding past the datagram is not ours to keep
        self.data.truncate(total_len);

        self.ip_id = Some(u16::from_be_bytes([self.data[4], self.data[5]]));
        let frag = u16::from_be_bytes([self.data[6], self.data[7]]);
        self.is_fragment = frag & 0x2000 != 0 || frag & 0x1FFF != 0;
        self.ttl = self.data[8];
        self.protocol = Protocol::from_number(self.data[9]);
        self.src_addr = IpAddr::V4(Ipv4Addr::new(
            self.data[12],
            self.data[13],
            self.data[14],
            self.data[15],
        ));
        self.dst_addr = IpAddr::V4(Ipv4Addr::new(
            self.data[16],
            self.data[17],
            self.data[18],
            self.data[19],
        ));

        if self.is_fragment {
            return Ok(());
        }
        self.parse_transport()
    }

    fn parse_ipv6(&mut self) -> Result<()> {
        if self.data.len() < IPV6_HEADER {
            return Err(Error::PacketTooSmall {
                expected: IPV6_HEADER,
                actual: self.data.len(),
            });
        }

        self.ip_version = IpVersion::V6;
        self.ip_header_len = IPV6_HEADER;
        self.ip_id = None;

        let payload_len = usize::from(u16::from_be_bytes([self.data[4], self.data[5]]));
        if IPV6_HEADER + payload_len > self.data.len() {
            return Err(Error::packet_parse_at("IPv6 payload length exceeds buffer", 4));
        }
        self.data.truncate(IPV6_HEADER + payload_len);

        self.ttl = self.data[7];

        let mut src_bytes = [0u8; 16];
        let mut dst_bytes = [0u8; 16];
        src_bytes.copy_from_slice(&self.data[8..24]);
        dst_bytes.copy_from_slice(&self.data[24..40]);
        self.src_addr = IpAddr::V6(Ipv6Addr::from(src_bytes));
        self.dst_addr = IpAddr::V6(Ipv6Addr::from(dst_bytes));

        let next_header = self.data[6];
        if next_header == ipproto::IPV6_FRAGMENT {
            if self.data.len() < IPV6_HEADER + IPV6_FRAGMENT_HEADER {
                return Err(Error::PacketTooSmall {
                    expected: IPV6_HEADER + IPV6_FRAGMENT_HEADER,
                    actual: self.data.len(),
                });
            }
            self.is_fragment = true;
            self.protocol = Protocol::from_number(self.data[IPV6_HEADER]);
            self.ip_header_len = IPV6_HEADER + IPV6_FRAGMENT_HEADER;
            return Ok(());
        }

        self.protocol = Protocol::from_number(next_header);
        self.parse_transport()
    }

    fn parse_transport(&mut self) -> Result<()> {
        let offset = self.ip_header_len;

        match self.protocol {
            Protocol::Tcp => {
                if self.data.len() < offset + TCP_MIN_HEADER {
                    return Err(Error::PacketTooSmall {
                        expected: offset + TCP_MIN_HEADER,
                        actual: self.data.len(),
                    });
                }

                self.src_port = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
                self.dst_port = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
                self.transport_header_len = usize::from(self.data[offset + 12] >> 4) * 4;

                if self.transport_header_len < TCP_MIN_HEADER
                    || offset + self.transport_header_len > self.data.len()
                {
                    return Err(Error::packet_parse_at(
                        "TCP data offset out of range",
                        offset + 12,
                    ));
                }

                self.tcp_flags = Some(TcpFlags::from_byte(self.data[offset + 13]));
            }
            Protocol::Udp => {
                if self.data.len() < offset + UDP_HEADER {
                    return Err(Error::PacketTooSmall {
                        expected: offset + UDP_HEADER,
                        actual: self.data.len(),
                    });
                }

                self.src_port = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
                self.dst_port = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
                self.transport_header_len = UDP_HEADER;
                self.tcp_flags = None;
            }
            _ => {
                self.transport_header_len = 0;
            }
        }

        Ok(())
    }

    /// Offset of the first payload byte within the packet
    pub fn payload_offset(&self) -> usize {
        self.ip_header_len + self.transport_header_len
    }

    /// IP header length in bytes
    pub fn ip_header_len(&self) -> usize {
        self.ip_header_len
    }

    /// Transport header length in bytes
    pub fn transport_header_len(&self) -> usize {
        self.transport_header_len
    }

    /// Get the payload (data after headers)
    pub fn payload(&self) -> &[u8] {
        let offset = self.payload_offset();
        if offset < self.data.len() {
            &self.data[offset..]
        } else {
            &[]
        }
    }

    /// Get payload length
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Transport header plus payload
    pub fn transport_segment(&self) -> &[u8] {
        &self.data[self.ip_header_len..]
    }

    /// Check if this is a TCP packet
    pub fn is_tcp(&self) -> bool {
        matches!(self.protocol, Protocol::Tcp)
    }

    /// Check if this is a UDP packet
    pub fn is_udp(&self) -> bool {
        matches!(self.protocol, Protocol::Udp)
    }

    /// Check if this is IPv4
    pub fn is_ipv4(&self) -> bool {
        matches!(self.ip_version, IpVersion::V4)
    }

    /// Check if this is IPv6
    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip_version, IpVersion::V6)
    }

    /// Check if TCP SYN flag is set without ACK
    pub fn is_syn(&self) -> bool {
        self.tcp_flags.is_some_and(|f| f.syn && !f.ack)
    }

    /// Check if TCP RST flag is set
    pub fn is_rst(&self) -> bool {
        self.tcp_flags.is_some_and(|f| f.rst)
    }

    /// Get the raw packet data
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get total packet length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if packet is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clone packet data into a new Bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    fn read_u32(&self, offset: usize) -> Option<u32> {
        self.data
            .get(offset..offset + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Get TCP sequence number
    pub fn tcp_seq(&self) -> Option<u32> {
        if !self.is_tcp() || self.is_fragment {
            return None;
        }
        self.read_u32(self.ip_header_len + 4)
    }

    /// Get TCP acknowledgment number
    pub fn tcp_ack_num(&self) -> Option<u32> {
        if !self.is_tcp() || self.is_fragment {
            return None;
        }
        self.read_u32(self.ip_header_len + 8)
    }

    /// Urgent pointer of a TCP segment
    pub fn tcp_urgent_ptr(&self) -> Option<u16> {
        if !self.is_tcp() || self.is_fragment {
            return None;
        }
        let offset = self.ip_header_len + 18;
        Some(u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
    }

    /// Transport checksum as stored in the packet
    pub fn transport_checksum(&self) -> Option<u16> {
        let offset = self.checksum_offset()?;
        Some(u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
    }

    /// Set TTL/Hop Limit (the IPv4 header checksum follows)
    pub fn set_ttl(&mut self, ttl: u8) {
        match self.ip_version {
            IpVersion::V4 => self.data[8] = ttl,
            IpVersion::V6 => self.data[7] = ttl,
        }
        self.ttl = ttl;
        self.fix_ip_checksum();
    }

    /// Rewrite the destination address (same IP family only)
    pub fn set_dst_addr(&mut self, addr: IpAddr) -> Result<()> {
        match (self.ip_version, addr) {
            (IpVersion::V4, IpAddr::V4(a)) => self.data[16..20].copy_from_slice(&a.octets()),
            (IpVersion::V6, IpAddr::V6(a)) => self.data[24..40].copy_from_slice(&a.octets()),
            _ => return Err(Error::precondition("rewrite", "address family mismatch")),
        }
        self.dst_addr = addr;
        Ok(())
    }

    /// Rewrite the source address (same IP family only)
    pub fn set_src_addr(&mut self, addr: IpAddr) -> Result<()> {
        match (self.ip_version, addr) {
            (IpVersion::V4, IpAddr::V4(a)) => self.data[12..16].copy_from_slice(&a.octets()),
            (IpVersion::V6, IpAddr::V6(a)) => self.data[8..24].copy_from_slice(&a.octets()),
            _ => return Err(Error::precondition("rewrite", "address family mismatch")),
        }
        self.src_addr = addr;
        Ok(())
    }

    /// Rewrite the transport source port
    pub fn set_src_port(&mut self, port: u16) {
        if self.transport_header_len > 0 {
            let offset = self.ip_header_len;
            self.data[offset..offset + 2].copy_from_slice(&port.to_be_bytes());
            self.src_port = port;
        }
    }

    /// Rewrite the transport destination port
    pub fn set_dst_port(&mut self, port: u16) {
        if self.transport_header_len > 0 {
            let offset = self.ip_header_len + 2;
            self.data[offset..offset + 2].copy_from_slice(&port.to_be_bytes());
            self.dst_port = port;
        }
    }

    /// Set IPv4 identification (no-op for IPv6). Only the IPv4 header
    /// checksum is refreshed; the transport checksum does not cover it.
    pub fn set_ip_id(&mut self, id: u16) {
        if self.is_ipv4() {
            self.data[4..6].copy_from_slice(&id.to_be_bytes());
            self.ip_id = Some(id);
            self.fix_ip_checksum();
        }
    }

    /// Recompute the IPv4 header checksum only
    pub fn fix_ip_checksum(&mut self) {
        if self.is_ipv4() {
            let ihl = self.ip_header_len;
            let sum = Checksum::ipv4_header(&self.data[..ihl]);
            self.data[10..12].copy_from_slice(&sum.to_be_bytes());
        }
    }

    /// Set TCP sequence number
    pub fn set_tcp_seq(&mut self, seq: u32) {
        if self.is_tcp() && !self.is_fragment {
            let offset = self.ip_header_len + 4;
            self.data[offset..offset + 4].copy_from_slice(&seq.to_be_bytes());
        }
    }

    /// Set TCP acknowledgment number
    pub fn set_tcp_ack(&mut self, ack: u32) {
        if self.is_tcp() && !self.is_fragment {
            let offset = self.ip_header_len + 8;
            self.data[offset..offset + 4].copy_from_slice(&ack.to_be_bytes());
        }
    }

    /// Replace all TCP flags
    pub fn set_tcp_flags(&mut self, flags: TcpFlags) {
        if self.is_tcp() && !self.is_fragment {
            self.data[self.ip_header_len + 13] = flags.to_byte();
            self.tcp_flags = Some(flags);
        }
    }

    /// Set or clear PSH while keeping the other flags
    pub fn set_psh(&mut self, psh: bool) {
        if let Some(mut flags) = self.tcp_flags {
            flags.psh = psh;
            self.set_tcp_flags(flags);
        }
    }

    /// Mark the segment urgent with the given pointer
    pub fn set_urgent(&mut self, pointer: u16) {
        if let Some(mut flags) = self.tcp_flags {
            flags.urg = true;
            self.set_tcp_flags(flags);
            let offset = self.ip_header_len + 18;
            self.data[offset..offset + 2].copy_from_slice(&pointer.to_be_bytes());
        }
    }

    /// Overwrite payload bytes in place, keeping the packet size
    pub fn overwrite_payload(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        let start = self.payload_offset() + at;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(Error::precondition(
                "overwrite",
                "replacement runs past the payload",
            ));
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy of this packet with the payload replaced. Lengths and checksums
    /// are rewritten and the header view is rebuilt from the new bytes.
    pub fn with_payload(&self, payload: &[u8]) -> Result<Self> {
        let header_len = self.payload_offset();
        if header_len + payload.len() > MAX_PACKET_SIZE {
            return Err(Error::precondition("resize", "packet would exceed maximum size"));
        }
        let mut data = BytesMut::with_capacity(header_len + payload.len());
        data.extend_from_slice(&self.data[..header_len]);
        data.extend_from_slice(payload);
        Self::write_lengths(&mut data, self.ip_version, self.ip_header_len, self.protocol);
        let mut packet = self.rebuilt(data)?;
        packet.fix_checksums();
        Ok(packet)
    }

    /// Split packet at payload offset, returns (first, second) segments.
    /// The second segment's sequence number is advanced by `offset`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn split_at_payload(&self, offset: usize) -> Result<(Self, Self)> {
        let payload = self.payload();

        if offset == 0 || offset >= payload.len() {
            return Err(Error::precondition(
                "split",
                format!("offset {offset} outside payload of {} bytes", payload.len()),
            ));
        }

        let first = self.with_payload(&payload[..offset])?;
        let mut second = self.with_payload(&payload[offset..])?;
        if let Some(seq) = self.tcp_seq() {
            second.set_tcp_seq(seq.wrapping_add(offset as u32));
            second.fix_checksums();
        }

        Ok((first, second))
    }

    /// Rewrite IP total/payload length and UDP length for the current buffer
    #[allow(clippy::cast_possible_truncation)]
    fn write_lengths(data: &mut [u8], version: IpVersion, ip_header_len: usize, proto: Protocol) {
        let total_len = data.len();
        match version {
            IpVersion::V4 => {
                data[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            }
            IpVersion::V6 => {
                let payload_len = (total_len - IPV6_HEADER) as u16;
                data[4..6].copy_from_slice(&payload_len.to_be_bytes());
            }
        }
        if proto == Protocol::Udp && total_len >= ip_header_len + UDP_HEADER {
            let udp_len = (total_len - ip_header_len) as u16;
            data[ip_header_len + 4..ip_header_len + 6].copy_from_slice(&udp_len.to_be_bytes());
        }
    }

    fn checksum_offset(&self) -> Option<usize> {
        if self.is_fragment {
            return None;
        }
        match self.protocol {
            Protocol::Tcp => Some(self.ip_header_len + 16),
            Protocol::Udp => Some(self.ip_header_len + 6),
            _ => None,
        }
    }

    /// Rewrite lengths, the IPv4 header checksum and the TCP/UDP checksum.
    /// Fragments only get their IP header fixed.
    pub fn fix_checksums(&mut self) {
        let length_proto = if self.is_fragment {
            Protocol::Other(0)
        } else {
            self.protocol
        };
        Self::write_lengths(&mut self.data, self.ip_version, self.ip_header_len, length_proto);

        self.fix_ip_checksum();

        let Some(offset) = self.checksum_offset() else {
            return;
        };
        self.data[offset] = 0;
        self.data[offset + 1] = 0;

        let proto = self.protocol.number();
        let segment = &self.data[self.ip_header_len..];
        let mut sum = match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Checksum::transport_v4(src, dst, proto, segment),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Checksum::transport_v6(src, dst, proto, segment),
            _ => return,
        };
        if sum == 0 && self.protocol == Protocol::Udp {
            sum = 0xFFFF;
        }
        self.data[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
    }

    /// Deliberately invalidate the transport checksum so any receiving stack
    /// discards the packet
    pub fn corrupt_checksum(&mut self) {
        if let Some(offset) = self.checksum_offset() {
            let sum = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
            let bad = sum.wrapping_add(0x1337) | 1;
            let bad = if bad == sum { sum ^ 0x00FF } else { bad };
            self.data[offset..offset + 2].copy_from_slice(&bad.to_be_bytes());
        }
    }

    /// Whether the IPv4 header checksum and the transport checksum are valid
    pub fn checksums_valid(&self) -> bool {
        if self.is_ipv4() && Checksum::internet(&self.data[..self.ip_header_len]) != 0 {
            return false;
        }
        if self.checksum_offset().is_none() {
            return true;
        }
        let proto = self.protocol.number();
        let segment = self.transport_segment();
        match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Checksum::verify_v4(src, dst, proto, segment),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Checksum::verify_v6(src, dst, proto, segment),
            _ => false,
        }
    }
}
