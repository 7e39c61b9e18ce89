//! DNS redirection
//!
//! Queries for target names are sent to an alternative resolver. The
//! caller remembers the original destination per (client port, txid) and
//! rewrites the response source back so the stub resolver accepts it.

use crate::conntrack::OriginalDestination;
use crate::error::{Error, Result};
use crate::packet::Packet;
use std::net::IpAddr;
use tracing::{debug, instrument};

const HEADER_LEN: usize = 12;

/// Whether a UDP payload looks like a DNS query
pub fn is_dns_query(payload: &[u8]) -> bool {
    if payload.len() < HEADER_LEN {
        return false;
    }

    // QR bit clear
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    if flags & 0x8000 != 0 {
        return false;
    }

    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    let ancount = u16::from_be_bytes([payload[6], payload[7]]);
    qdcount > 0 && ancount == 0
}

/// Whether a UDP payload looks like a DNS response
pub fn is_dns_response(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN && payload[2] & 0x80 != 0
}

/// Transaction ID
pub fn dns_txid(payload: &[u8]) -> Option<u16> {
    (payload.len() >= HEADER_LEN).then(|| u16::from_be_bytes([payload[0], payload[1]]))
}

/// Name of the first question, lower-cased without the trailing dot
pub fn query_name(payload: &[u8]) -> Option<String> {
    if !is_dns_query(payload) {
        return None;
    }
    let mut pos = HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();
    loop {
        let len = usize::from(*payload.get(pos)?);
        pos += 1;
        if len == 0 {
            break;
        }
        // Compression pointers never appear in a question we can use
        if len & 0xC0 != 0 {
            return None;
        }
        let label = payload.get(pos..pos + len)?;
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += len;
    }
    (!labels.is_empty()).then(|| labels.join("."))
}

/// Copy of `packet` addressed to `resolver:port`
#[instrument(level = "debug", skip(packet), fields(from = %packet.dst_addr))]
pub fn redirect_query(packet: &Packet, resolver: IpAddr, port: u16) -> Result<Packet> {
    if !packet.is_udp() {
        return Err(Error::precondition("dns_redirect", "not a UDP datagram"));
    }
    let mut out = packet.clone();
    out.set_dst_addr(resolver)?;
    out.set_dst_port(port);
    out.fix_checksums();
    debug!(%resolver, port, "redirecting DNS query");
    Ok(out)
}

/// Copy of a resolver response that appears to come from `original`
pub fn restore_response(packet: &Packet, original: &OriginalDestination) -> Result<Packet> {
    if !packet.is_udp() {
        return Err(Error::precondition("dns_redirect", "not a UDP datagram"));
    }
    let mut out = packet.clone();
    out.set_src_addr(original.addr)?;
    out.set_src_port(original.port);
    out.fix_checksums();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Direction, PacketBuilder};
    use std::net::Ipv4Addr;

    fn query(name: &str) -> Vec<u8> {
        let mut msg = vec![
            0x12, 0x34, // Transaction ID
            0x01, 0x00, // Standard query, recursion desired
            0x00, 0x01, // Questions: 1
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            msg.push(u8::try_from(label.len()).unwrap());
            msg.extend_from_slice(label.as_bytes());
        }
        msg.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
        msg
    }

    fn query_packet() -> Packet {
        let bytes = PacketBuilder::udp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4([192, 168, 1, 1])
            .src_port(53000)
            .dst_port(53)
            .payload(&query("WWW.Blocked.Example"))
            .build();
        Packet::from_bytes(&bytes, Direction::Outbound).unwrap()
    }

    #[test]
    fn test_dns_query_detection() {
        let msg = query("example.com");
        assert!(is_dns_query(&msg));
        assert!(!is_dns_response(&msg));
        assert_eq!(dns_txid(&msg), Some(0x1234));
    }

    #[test]
    fn test_dns_response_not_query() {
        let response = [
            0x12, 0x34, // Transaction ID
            0x81, 0x80, // Flags: response
            0x00, 0x01, // Questions: 1
            0x00, 0x01, // Answer RRs: 1
            0x00, 0x00, 0x00, 0x00,
        ];
        assert!(!is_dns_query(&response));
        assert!(is_dns_response(&response));
        assert_eq!(query_name(&response), None);
    }

    #[test]
    fn test_query_name_lowercased() {
        assert_eq!(
            query_name(&query("WWW.Blocked.Example")).as_deref(),
            Some("www.blocked.example")
        );
        let mut truncated = query("example.com");
        truncated.truncate(16);
        assert_eq!(query_name(&truncated), None);
    }

    #[test]
    fn test_redirect_and_restore() {
        let packet = query_packet();
        let resolver = IpAddr::V4(Ipv4Addr::new(77, 88, 8, 8));
        let redirected = redirect_query(&packet, resolver, 5353).unwrap();
        assert_eq!(redirected.dst_addr, resolver);
        assert_eq!(redirected.dst_port, 5353);
        assert!(redirected.checksums_valid());

        let bytes = PacketBuilder::udp_v4()
            .src_ip_v4([77, 88, 8, 8])
            .dst_ip_v4([10, 0, 0, 2])
            .src_port(5353)
            .dst_port(53000)
            .payload(&[0x12, 0x34, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0])
            .build();
        let response = Packet::from_bytes(&bytes, Direction::Inbound).unwrap();
        let original = OriginalDestination {
            addr: packet.dst_addr,
            port: 53,
        };
        let restored = restore_response(&response, &original).unwrap();
        assert_eq!(restored.src_addr, packet.dst_addr);
        assert_eq!(restored.src_port, 53);
        assert!(restored.checksums_valid());
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let packet = query_packet();
        let v6: IpAddr = "2001:db8::53".parse().unwrap();
        assert!(redirect_query(&packet, v6, 53).is_err());
    }
}
