//! Raw socket injection
//!
//! One IPv4 and one IPv6 raw socket opened with `IPPROTO_RAW`, so the
//! caller supplies the complete IP header. Both sockets carry `SO_MARK`;
//! the firewall rules skip marked packets, keeping injected traffic out of
//! the interception queue.

use crate::error::{PlatformError, Result};
use crate::traits::PacketSink;
use desync_core::packet::{fragment_ipv4, fragment_ipv6, mtu_offsets, Packet};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, trace};

const IPPROTO_RAW: i32 = 255;
const IPV6_HEADER_LEN: usize = 40;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;

/// Raw IPv4/IPv6 packet sender
#[derive(Debug)]
pub struct RawSender {
    v4: Socket,
    v6: Option<Socket>,
    mark: u32,
    fragment_id: AtomicU32,
}

impl RawSender {
    /// Open both raw sockets and tag them with `mark`
    ///
    /// # Errors
    /// Fails with [`PlatformError::Fatal`] or
    /// [`PlatformError::PermissionDenied`] when the IPv4 socket cannot be
    /// opened. A host without IPv6 only loses IPv6 injection.
    pub fn open(mark: u32) -> Result<Self> {
        let v4 = Self::raw_socket(Domain::IPV4, mark)?;
        let v6 = match Self::raw_socket(Domain::IPV6, mark) {
            Ok(socket) => Some(socket),
            Err(e) => {
                debug!(error = %e, "IPv6 raw socket unavailable");
                None
            }
        };
        info!(mark = format_args!("{mark:#x}"), ipv6 = v6.is_some(), "raw sender ready");
        Ok(Self {
            v4,
            v6,
            mark,
            fragment_id: AtomicU32::new(rand::random()),
        })
    }

    fn raw_socket(domain: Domain, mark: u32) -> Result<Socket> {
        let label = if domain == Domain::IPV4 { "ipv4" } else { "ipv6" };
        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))
            .map_err(|e| PlatformError::fatal(format!("{label} raw socket"), e))?;
        socket
            .set_mark(mark)
            .map_err(|e| PlatformError::fatal(format!("SO_MARK on {label} raw socket"), e))?;
        Ok(socket)
    }

    /// Mark carried by injected packets
    pub fn mark(&self) -> u32 {
        self.mark
    }

    fn transmit(&self, packet: &Packet) -> Result<()> {
        let socket = if packet.is_ipv4() {
            &self.v4
        } else {
            self.v6.as_ref().ok_or_else(|| PlatformError::Injection {
                dst: packet.dst_addr,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "IPv6 raw socket not available",
                ),
            })?
        };
        let dst = SockAddr::from(SocketAddr::new(packet.dst_addr, 0));
        socket
            .send_to(packet.as_bytes(), &dst)
            .map_err(|source| PlatformError::Injection {
                dst: packet.dst_addr,
                source,
            })?;
        trace!(dst = %packet.dst_addr, len = packet.len(), ttl = packet.ttl, "injected");
        Ok(())
    }
}

/// Split `packet` into IP fragments that fit `mtu`, or `None` if it
/// already fits or is itself a fragment. `id` is used for IPv6 only; IPv4
/// fragments keep the datagram's identification.
pub fn fragment_for_mtu(packet: &Packet, mtu: usize, id: u32) -> Result<Option<Vec<Packet>>> {
    if packet.len() <= mtu || packet.is_fragment {
        return Ok(None);
    }
    if packet.is_ipv4() {
        let offsets = mtu_offsets(packet.len(), packet.ip_header_len(), mtu);
        return Ok(Some(fragment_ipv4(packet, &offsets)?));
    }
    // Offsets are counted against the datagram as it will look with the
    // fragment header inserted
    let offsets = mtu_offsets(
        packet.len() + IPV6_FRAGMENT_HEADER_LEN,
        IPV6_HEADER_LEN + IPV6_FRAGMENT_HEADER_LEN,
        mtu,
    );
    Ok(Some(fragment_ipv6(packet, &offsets, id)?))
}

impl PacketSink for RawSender {
    fn send(&self, packet: &Packet) -> Result<()> {
        self.transmit(packet)
    }

    fn send_with_mtu(&self, packet: &Packet, mtu: usize) -> Result<()> {
        let id = self.fragment_id.fetch_add(1, Ordering::Relaxed);
        match fragment_for_mtu(packet, mtu, id)? {
            Some(fragments) => {
                debug!(count = fragments.len(), mtu, "fragmenting oversized packet");
                fragments.iter().try_for_each(|f| self.transmit(f))
            }
            None => self.transmit(packet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_core::packet::{Direction, PacketBuilder, TcpFlags};

    fn large_packet(v6: bool, len: usize) -> Packet {
        let payload = vec![0xAB; len];
        let builder = if v6 {
            PacketBuilder::tcp_v6()
                .src_ip_v6("2001:db8::1".parse().unwrap())
                .dst_ip_v6("2001:db8::2".parse().unwrap())
        } else {
            PacketBuilder::tcp_v4().src_ip_v4([10, 0, 0, 1]).dst_ip_v4([10, 0, 0, 2])
        };
        let bytes = builder.dst_port(443).flags(TcpFlags::data()).payload(&payload).build();
        Packet::from_bytes(&bytes, Direction::Outbound).unwrap()
    }

    #[test]
    fn test_small_packet_not_fragmented() {
        assert!(fragment_for_mtu(&large_packet(false, 100), 1500, 0).unwrap().is_none());
    }

    #[test]
    fn test_ipv4_fragments_fit_mtu() {
        let packet = large_packet(false, 3000);
        let fragments = fragment_for_mtu(&packet, 1500, 0).unwrap().unwrap();
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.len() <= 1500 && f.is_fragment));
        let carried: usize = fragments.iter().map(|f| f.len() - 20).sum();
        assert_eq!(carried, packet.len() - 20);
    }

    #[test]
    fn test_ipv6_fragments_fit_mtu() {
        let packet = large_packet(true, 2000);
        let fragments = fragment_for_mtu(&packet, 1280, 7).unwrap().unwrap();
        assert!(fragments.len() >= 2);
        assert!(fragments.iter().all(|f| f.len() <= 1280));
    }
}
