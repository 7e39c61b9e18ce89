//! Packet builder utilities

use super::{Checksum, IpVersion, Protocol, TcpFlags};
use bytes::{BufMut, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Builder for constructing IPv4/IPv6 TCP/UDP packets with valid checksums
pub struct PacketBuilder {
    ip_version: IpVersion,
    protocol: Protocol,
    src_ip: [u8; 16],
    dst_ip: [u8; 16],
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    ip_id: u16,
    tcp_flags: TcpFlags,
    seq: u32,
    ack: u32,
    window: u16,
    payload: Vec<u8>,
}

impl PacketBuilder {
    fn new(ip_version: IpVersion, protocol: Protocol) -> Self {
        Self {
            ip_version,
            protocol,
            src_ip: [0; 16],
            dst_ip: [0; 16],
            src_port: 0,
            dst_port: 0,
            ttl: 64,
            ip_id: 0,
            tcp_flags: TcpFlags::default(),
            seq: 0,
            ack: 0,
            window: 0xFFFF,
            payload: Vec::new(),
        }
    }

    /// Create new IPv4 TCP packet builder
    pub fn tcp_v4() -> Self {
        Self::new(IpVersion::V4, Protocol::Tcp)
    }

    /// Create new IPv6 TCP packet builder
    pub fn tcp_v6() -> Self {
        Self::new(IpVersion::V6, Protocol::Tcp)
    }

    /// Create new IPv4 UDP packet builder
    pub fn udp_v4() -> Self {
        Self::new(IpVersion::V4, Protocol::Udp)
    }

    /// Create new IPv6 UDP packet builder
    pub fn udp_v6() -> Self {
        Self::new(IpVersion::V6, Protocol::Udp)
    }

    /// Set source IP (IPv4)
    pub fn src_ip_v4(mut self, ip: [u8; 4]) -> Self {
        self.src_ip[..4].copy_from_slice(&ip);
        self
    }

    /// Set destination IP (IPv4)
    pub fn dst_ip_v4(mut self, ip: [u8; 4]) -> Self {
        self.dst_ip[..4].copy_from_slice(&ip);
        self
    }

    /// Set source IP (IPv6)
    pub fn src_ip_v6(mut self, ip: Ipv6Addr) -> Self {
        self.src_ip = ip.octets();
        self
    }

    /// Set destination IP (IPv6)
    pub fn dst_ip_v6(mut self, ip: Ipv6Addr) -> Self {
        self.dst_ip = ip.octets();
        self
    }

    /// Set source port
    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    /// Set destination port
    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Set TTL / hop limit
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set IPv4 identification
    pub fn ip_id(mut self, id: u16) -> Self {
        self.ip_id = id;
        self
    }

    /// Set TCP flags
    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = flags;
        self
    }

    /// Set sequence number
    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Set acknowledgment number
    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    /// Set TCP window
    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    /// Set payload
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    fn transport(&self) -> BytesMut {
        let mut seg = BytesMut::new();
        seg.put_u16(self.src_port);
        seg.put_u16(self.dst_port);
        match self.protocol {
            Protocol::Udp => {
                #[allow(clippy::cast_possible_truncation)]
                let len = (8 + self.payload.len()) as u16;
                seg.put_u16(len);
                seg.put_u16(0);
            }
            _ => {
                seg.put_u32(self.seq);
                seg.put_u32(self.ack);
                seg.put_u8(0x50); // Data offset 5 words
                seg.put_u8(self.tcp_flags.to_byte());
                seg.put_u16(self.window);
                seg.put_u16(0);
                seg.put_u16(0);
            }
        }
        seg.extend_from_slice(&self.payload);
        seg
    }

    fn fold_udp_zero(&self, sum: u16) -> u16 {
        if sum == 0 && self.protocol == Protocol::Udp {
            0xFFFF
        } else {
            sum
        }
    }

    /// Build the packet
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Vec<u8> {
        let proto = self.protocol.number();
        let mut seg = self.transport();
        let csum_at = if self.protocol == Protocol::Udp { 6 } else { 16 };

        let mut packet = BytesMut::new();
        match self.ip_version {
            IpVersion::V4 => {
                let src = Ipv4Addr::new(self.src_ip[0], self.src_ip[1], self.src_ip[2], self.src_ip[3]);
                let dst = Ipv4Addr::new(self.dst_ip[0], self.dst_ip[1], self.dst_ip[2], self.dst_ip[3]);
                let sum = self.fold_udp_zero(Checksum::transport_v4(src, dst, proto, &seg));
                seg[csum_at..csum_at + 2].copy_from_slice(&sum.to_be_bytes());

                let total_len = (20 + seg.len()) as u16;
                packet.put_u8(0x45);
                packet.put_u8(0);
                packet.put_u16(total_len);
                packet.put_u16(self.ip_id);
                packet.put_u16(0x4000); // DF
                packet.put_u8(self.ttl);
                packet.put_u8(proto);
                packet.put_u16(0);
                packet.extend_from_slice(&src.octets());
                packet.extend_from_slice(&dst.octets());
                let hsum = Checksum::ipv4_header(&packet);
                packet[10..12].copy_from_slice(&hsum.to_be_bytes());
            }
            IpVersion::V6 => {
                let src = Ipv6Addr::from(self.src_ip);
                let dst = Ipv6Addr::from(self.dst_ip);
                let sum = self.fold_udp_zero(Checksum::transport_v6(src, dst, proto, &seg));
                seg[csum_at..csum_at + 2].copy_from_slice(&sum.to_be_bytes());

                packet.put_u32(0x6000_0000);
                packet.put_u16(seg.len() as u16);
                packet.put_u8(proto);
                packet.put_u8(self.ttl);
                packet.extend_from_slice(&src.octets());
                packet.extend_from_slice(&dst.octets());
            }
        }
        packet.extend_from_slice(&seg);
        packet.to_vec()
    }
}
