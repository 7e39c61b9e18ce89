//! Header field types shared by the packet view and builder

/// Packet direction relative to this host
///
/// The interception layer derives it from the netfilter hook the packet
/// was queued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Leaving the host
    Outbound,
    /// Arriving at the host
    Inbound,
}

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Transport protocol carried by a datagram
///
/// Anything other than TCP and UDP is passed through untouched, so only
/// its number is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// Any other protocol number
    Other(u8),
}

impl Protocol {
    /// Protocol from its IP protocol / next-header number
    pub fn from_number(number: u8) -> Self {
        match number {
            ipproto::TCP => Protocol::Tcp,
            ipproto::UDP => Protocol::Udp,
            n => Protocol::Other(n),
        }
    }

    /// IP protocol / next-header number
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => ipproto::TCP,
            Protocol::Udp => ipproto::UDP,
            Protocol::Other(n) => n,
        }
    }
}

/// TCP control bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct TcpFlags {
    /// FIN
    pub fin: bool,
    /// SYN
    pub syn: bool,
    /// RST
    pub rst: bool,
    /// PSH
    pub psh: bool,
    /// ACK
    pub ack: bool,
    /// URG
    pub urg: bool,
    /// ECE, preserved when flags are rewritten
    pub ece: bool,
    /// CWR, preserved when flags are rewritten
    pub cwr: bool,
}

impl TcpFlags {
    const FIN: u8 = 0x01;
    const SYN: u8 = 0x02;
    const RST: u8 = 0x04;
    const PSH: u8 = 0x08;
    const ACK: u8 = 0x10;
    const URG: u8 = 0x20;
    const ECE: u8 = 0x40;
    const CWR: u8 = 0x80;

    /// Decode byte 13 of a TCP header
    pub fn from_byte(byte: u8) -> Self {
        let has = |bit: u8| byte & bit != 0;
        Self {
            fin: has(Self::FIN),
            syn: has(Self::SYN),
            rst: has(Self::RST),
            psh: has(Self::PSH),
            ack: has(Self::ACK),
            urg: has(Self::URG),
            ece: has(Self::ECE),
            cwr: has(Self::CWR),
        }
    }

    /// Encode as byte 13 of a TCP header
    pub fn to_byte(self) -> u8 {
        [
            (self.fin, Self::FIN),
            (self.syn, Self::SYN),
            (self.rst, Self::RST),
            (self.psh, Self::PSH),
            (self.ack, Self::ACK),
            (self.urg, Self::URG),
            (self.ece, Self::ECE),
            (self.cwr, Self::CWR),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |byte, (_, bit)| byte | bit)
    }

    /// ACK + PSH, as on a ClientHello segment
    pub fn data() -> Self {
        Self {
            ack: true,
            psh: true,
            ..Self::default()
        }
    }

    /// Bare SYN opening a connection
    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Self::default()
        }
    }

    /// Bare ACK
    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    /// RST + ACK
    pub fn rst_ack() -> Self {
        Self {
            rst: true,
            ..Self::ack()
        }
    }

    /// FIN + ACK
    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ..Self::ack()
        }
    }
}

/// IP protocol numbers used when building headers
pub mod ipproto {
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// IPv6 Fragment extension header
    pub const IPV6_FRAGMENT: u8 = 44;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bytes() {
        assert_eq!(TcpFlags::data().to_byte(), 0x18);
        assert_eq!(TcpFlags::syn().to_byte(), 0x02);
        assert_eq!(TcpFlags::rst_ack().to_byte(), 0x14);
        assert_eq!(TcpFlags::fin_ack().to_byte(), 0x11);
        assert_eq!(TcpFlags::default().to_byte(), 0);
    }

    #[test]
    fn test_every_byte_survives_decode() {
        for byte in 0..=u8::MAX {
            assert_eq!(TcpFlags::from_byte(byte).to_byte(), byte);
        }
    }

    #[test]
    fn test_ecn_bits_kept() {
        let flags = TcpFlags::from_byte(0xd8);
        assert!(flags.ece && flags.cwr && flags.ack && flags.psh);
        assert!(!flags.syn);
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::from_number(6), Protocol::Tcp);
        assert_eq!(Protocol::from_number(17), Protocol::Udp);
        assert_eq!(Protocol::from_number(1), Protocol::Other(1));
        assert_eq!(Protocol::Other(58).number(), 58);
        assert_eq!(Protocol::Udp.number(), ipproto::UDP);
    }
}
