//! Evasion strategy catalog
//!
//! Turns one matched packet into a [`SendPlan`]: the ordered list of
//! packets (and the pause before each) that replaces it on the wire.
//! Injection layers run around the configured fragmentation strategy:
//!
//! 1. ClientHello mutation, when the segment holds a whole record
//! 2. Desync control packets
//! 3. Fake-SNI decoys
//! 4. Fragmentation of the real bytes
//!
//! A strategy whose precondition fails degrades to TCP fragmentation at
//! the default position; if that fails too the caller passes the packet
//! through untouched.

mod desync;
mod dns_redirect;
mod fake;
mod fragment;
mod mutation;

pub use desync::control_packets;
pub use dns_redirect::{
    dns_txid, is_dns_query, is_dns_response, query_name, redirect_query, restore_response,
};
pub use fake::{fake_datagrams, fake_payload, fake_segments, syn_fakes};
pub use fragment::{apply as fragment, tcp_split_at, SplitInput};
pub use mutation::mutate;

use crate::config::{CompiledSet, FragStrategy, FragmentationConfig};
use crate::error::Result;
use crate::packet::Packet;
use crate::tls::{self, ClientHelloLayout, Extraction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// One packet of a plan and the pause before sending it
#[derive(Debug, Clone)]
pub struct Emit {
    /// Packet to send
    pub packet: Packet,
    /// Wait before sending
    pub delay: Duration,
}

impl Emit {
    /// Send without waiting
    pub fn now(packet: Packet) -> Self {
        Self {
            packet,
            delay: Duration::ZERO,
        }
    }

    /// Send after `delay`
    pub fn after(packet: Packet, delay: Duration) -> Self {
        Self { packet, delay }
    }
}

/// Ordered replacement for one intercepted packet
#[derive(Debug, Clone, Default)]
pub struct SendPlan {
    steps: Vec<Emit>,
}

impl SendPlan {
    /// Empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    pub fn push(&mut self, emit: Emit) {
        self.steps.push(emit);
    }

    /// Append packets with no delay
    pub fn extend_now(&mut self, packets: impl IntoIterator<Item = Packet>) {
        self.steps.extend(packets.into_iter().map(Emit::now));
    }

    /// Steps in send order
    pub fn iter(&self) -> std::slice::Iter<'_, Emit> {
        self.steps.iter()
    }

    /// Packets in send order
    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.steps.iter().map(|e| &e.packet)
    }

    /// Sum of all delays
    pub fn total_delay(&self) -> Duration {
        self.steps.iter().map(|e| e.delay).sum()
    }

    /// Number of packets
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if nothing would be sent
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl IntoIterator for SendPlan {
    type Item = Emit;
    type IntoIter = std::vec::IntoIter<Emit>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}

impl<'a> IntoIterator for &'a SendPlan {
    type Item = &'a Emit;
    type IntoIter = std::slice::Iter<'a, Emit>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

fn mutated(
    packet: &Packet,
    layout: Option<&ClientHelloLayout>,
    set: &CompiledSet,
) -> Option<(Packet, ClientHelloLayout)> {
    let cfg = &set.evasion.mutation;
    if !cfg.enabled {
        return None;
    }
    let bytes = mutation::mutate(packet.payload(), layout?, cfg)?;
    let rewritten = match packet.with_payload(&bytes) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "mutated ClientHello does not fit the packet");
            return None;
        }
    };
    match tls::parse_record(rewritten.payload()) {
        Extraction::Parsed(layout) => Some((rewritten, layout)),
        _ => None,
    }
}

/// Build the plan that replaces the segment completing a ClientHello.
///
/// `layout` is relative to `packet`'s payload. An error means the packet
/// must pass through unmodified.
pub fn plan_client_hello(
    packet: &Packet,
    layout: Option<&ClientHelloLayout>,
    set: &CompiledSet,
) -> Result<SendPlan> {
    let evasion = &set.evasion;
    let owned = mutated(packet, layout, set);
    let (real, layout) = match &owned {
        Some((p, l)) => (p, Some(l)),
        None => (packet, layout),
    };

    let mut plan = SendPlan::new();

    if evasion.desync.enabled {
        match desync::control_packets(real, &evasion.desync) {
            Ok(ctl) => plan.extend_now(ctl),
            Err(e) => debug!(set = %set.name, error = %e, "skipping desync packets"),
        }
    }

    if evasion.fake.enabled {
        match fake::fake_segments(real, &evasion.fake, set.custom_fake.as_deref()) {
            Ok(fakes) => plan.extend_now(fakes),
            Err(e) => debug!(set = %set.name, error = %e, "skipping fake segments"),
        }
    }

    let input = SplitInput {
        packet: real,
        layout,
        evasion,
        custom_fake: set.custom_fake.as_deref(),
    };
    let strategy = evasion.fragmentation.strategy;
    let pieces = match fragment::apply(strategy, &input) {
        Ok(pieces) => pieces,
        Err(e) => {
            debug!(
                set = %set.name,
                strategy = strategy.name(),
                error = %e,
                "falling back to tcp_frag"
            );
            fragment::tcp_split_at(real, FragmentationConfig::default().position)?
        }
    };
    for emit in pieces {
        plan.push(emit);
    }

    assign_ip_ids(&mut plan, real.ip_id);
    debug!(
        set = %set.name,
        strategy = strategy.name(),
        packets = plan.len(),
        "built send plan"
    );
    Ok(plan)
}

/// Build the plan for a matched QUIC Initial datagram. Only IP
/// fragmentation and decoys apply; anything else re-emits the datagram.
pub fn plan_datagram(packet: &Packet, set: &CompiledSet) -> Result<SendPlan> {
    let evasion = &set.evasion;
    let mut plan = SendPlan::new();

    if evasion.fake.enabled {
        match fake::fake_datagrams(packet, &evasion.fake) {
            Ok(fakes) => plan.extend_now(fakes),
            Err(e) => debug!(set = %set.name, error = %e, "skipping fake datagrams"),
        }
    }

    let pieces = if evasion.fragmentation.strategy == FragStrategy::IpFrag {
        let input = SplitInput {
            packet,
            layout: None,
            evasion,
            custom_fake: None,
        };
        fragment::apply(FragStrategy::IpFrag, &input).unwrap_or_else(|e| {
            debug!(set = %set.name, error = %e, "sending datagram unfragmented");
            vec![Emit::now(packet.clone())]
        })
    } else {
        vec![Emit::now(packet.clone())]
    };
    for emit in pieces {
        plan.push(emit);
    }

    assign_ip_ids(&mut plan, packet.ip_id);
    Ok(plan)
}

/// Decoy SYNs followed by the real SYN
pub fn plan_syn(syn: &Packet, set: &CompiledSet) -> Result<SendPlan> {
    let mut plan = SendPlan::new();
    plan.extend_now(fake::syn_fakes(syn, &set.evasion.fake, set.custom_fake.as_deref())?);
    plan.push(Emit::now(syn.clone()));
    assign_ip_ids(&mut plan, syn.ip_id);
    Ok(plan)
}

/// Give every datagram of the plan its own IPv4 identification. Fragments
/// that shared an identification keep sharing their new one.
fn assign_ip_ids(plan: &mut SendPlan, base: Option<u16>) {
    let mut next = base.unwrap_or_else(rand::random);
    let mut datagrams: HashMap<u16, u16> = HashMap::new();
    for emit in &mut plan.steps {
        let packet = &mut emit.packet;
        let Some(old) = packet.ip_id else {
            continue;
        };
        let id = if packet.is_fragment {
            *datagrams.entry(old).or_insert_with(|| {
                let id = next;
                next = next.wrapping_add(1);
                id
            })
        } else {
            let id = next;
            next = next.wrapping_add(1);
            id
        };
        packet.set_ip_id(id);
    }
}
