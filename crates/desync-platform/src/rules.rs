//! nftables rule builder
//!
//! Produces the ruleset that feeds the worker pool. The rules are printed
//! for the operator to install; nothing here touches the firewall.

use desync_core::Config;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Packets per connection sent to the queue; the ClientHello and its
/// handshake fit well within this window
pub const DEFAULT_TCP_PACKETS: u32 = 12;

/// Builder for the interception ruleset
///
/// # Example
///
/// ```rust
/// use desync_platform::RuleBuilder;
///
/// let rules = RuleBuilder::new(200, 2).mark(0x100).quic(false).build();
/// assert!(rules.contains("tcp dport 443 ct original packets 1-12 queue num 200-201 bypass"));
/// assert!(rules.contains("meta mark & 0x100 == 0x100 return"));
/// ```
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    table: String,
    start: u16,
    count: u16,
    mark: u32,
    tcp_packets: u32,
    quic: bool,
    dns: bool,
    resolvers: Vec<(IpAddr, u16)>,
}

impl RuleBuilder {
    /// Rules for queues `start..start+count`
    pub fn new(start: u16, count: u16) -> Self {
        Self {
            table: "desync".into(),
            start,
            count: count.max(1),
            mark: 0x4000_0000,
            tcp_packets: DEFAULT_TCP_PACKETS,
            quic: true,
            dns: false,
            resolvers: Vec::new(),
        }
    }

    /// Rules matching a configuration document
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new(config.queue.start, config.queue.threads)
            .mark(config.queue.mark)
            .quic(config.quic.enabled);
        for set in config.sets.iter().filter(|s| s.evasion.dns.enabled) {
            if let Some(resolver) = set.evasion.dns.resolver {
                builder = builder.dns(true).resolver(resolver, set.evasion.dns.port);
            }
        }
        builder
    }

    /// Table name
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = name.into();
        self
    }

    /// Socket mark of injected packets, which bypass the queue
    pub fn mark(mut self, mark: u32) -> Self {
        self.mark = mark;
        self
    }

    /// Leading packets of each TCP connection to queue
    pub fn tcp_packets(mut self, count: u32) -> Self {
        self.tcp_packets = count.max(1);
        self
    }

    /// Queue outgoing UDP 443
    pub fn quic(mut self, enabled: bool) -> Self {
        self.quic = enabled;
        self
    }

    /// Queue outgoing DNS queries
    pub fn dns(mut self, enabled: bool) -> Self {
        self.dns = enabled;
        self
    }

    /// Queue responses arriving from a redirect resolver
    pub fn resolver(mut self, addr: IpAddr, port: u16) -> Self {
        if !self.resolvers.contains(&(addr, port)) {
            self.resolvers.push((addr, port));
        }
        self
    }

    fn queue_target(&self) -> String {
        if self.count == 1 {
            format!("queue num {} bypass", self.start)
        } else {
            let last = self.start.saturating_add(self.count - 1);
            format!("queue num {}-{} bypass", self.start, last)
        }
    }

    /// Render the ruleset in `nft -f` syntax
    pub fn build(&self) -> String {
        let target = self.queue_target();
        let mut out = String::new();
        let _ = writeln!(out, "table inet {} {{", self.table);

        let _ = writeln!(out, "    chain output {{");
        let _ = writeln!(out, "        type filter hook output priority mangle; policy accept;");
        let _ = writeln!(out, "        meta mark & {0:#x} == {0:#x} return", self.mark);
        let _ = writeln!(
            out,
            "        tcp dport 443 ct original packets 1-{} {target}",
            self.tcp_packets
        );
        if self.quic {
            let _ = writeln!(out, "        udp dport 443 {target}");
        }
        if self.dns {
            let _ = writeln!(out, "        udp dport 53 {target}");
        }
        let _ = writeln!(out, "    }}");

        if !self.resolvers.is_empty() {
            let _ = writeln!(out, "    chain input {{");
            let _ = writeln!(out, "        type filter hook input priority mangle; policy accept;");
            for (addr, port) in &self.resolvers {
                let family = if addr.is_ipv4() { "ip" } else { "ip6" };
                let _ = writeln!(out, "        {family} saddr {addr} udp sport {port} {target}");
            }
            let _ = writeln!(out, "    }}");
        }

        out.push_str("}\n");
        out
    }
}
