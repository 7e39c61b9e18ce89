//! Control-packet desynchronization
//!
//! RST, FIN or bare ACK segments on the real flow, sent ahead of the
//! ClientHello with a short TTL and a broken checksum. A middlebox that
//! tracks them tears down or resets its flow state; the server never sees
//! them.

use crate::config::{DesyncConfig, DesyncMode};
use crate::error::{Error, Result};
use crate::packet::{Packet, TcpFlags};

fn flags_for(mode: DesyncMode) -> Vec<TcpFlags> {
    let rst = TcpFlags::rst_ack();
    let fin = TcpFlags::fin_ack();
    let ack = TcpFlags::ack();
    match mode {
        DesyncMode::Rst => vec![rst],
        DesyncMode::Fin => vec![fin],
        DesyncMode::Ack => vec![ack],
        DesyncMode::Combo => vec![rst, fin, ack],
    }
}

/// Control packets for the real segment `packet`, in send order
pub fn control_packets(packet: &Packet, cfg: &DesyncConfig) -> Result<Vec<Packet>> {
    if !packet.is_tcp() {
        return Err(Error::precondition("desync", "not a TCP segment"));
    }
    flags_for(cfg.mode)
        .into_iter()
        .map(|flags| {
            let mut ctl = packet.with_payload(&[])?;
            ctl.set_tcp_flags(flags);
            ctl.set_ttl(cfg.ttl);
            ctl.fix_checksums();
            if cfg.bad_checksum {
                ctl.corrupt_checksum();
            }
            Ok(ctl)
        })
        .collect()
}
