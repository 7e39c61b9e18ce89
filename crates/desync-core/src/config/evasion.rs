//! Per-target-set evasion parameters
//!
//! One [`EvasionConfig`] describes everything the strategy catalog needs to
//! turn a matched ClientHello into a send plan. It is immutable once
//! published; changes go through a fresh [`super::ConfigHandle::update`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Fragmentation strategy applied to the real ClientHello
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragStrategy {
    /// Re-emit the payload unsplit
    None,
    /// Two TCP segments
    #[default]
    TcpFrag,
    /// Two IP fragments of one datagram
    IpFrag,
    /// Two TLS records, then TCP split at the record boundary
    TlsRecordSplit,
    /// TCP split with the urgent pointer on the first segment
    Oob,
    /// Decoy-hostname segment overlapped by the true payload
    Overlap,
    /// Several pieces sent out of order
    Disorder,
    /// First piece, pause, then the rest shuffled
    Combo,
    /// Split right before the `server_name` extension
    ExtensionSplit,
}

impl FragStrategy {
    /// Every strategy, in catalog order
    pub const ALL: [FragStrategy; 9] = [
        FragStrategy::None,
        FragStrategy::TcpFrag,
        FragStrategy::IpFrag,
        FragStrategy::TlsRecordSplit,
        FragStrategy::Oob,
        FragStrategy::Overlap,
        FragStrategy::Disorder,
        FragStrategy::Combo,
        FragStrategy::ExtensionSplit,
    ];

    /// Short name used in logs and trial names
    pub fn name(self) -> &'static str {
        match self {
            FragStrategy::None => "none",
            FragStrategy::TcpFrag => "tcp_frag",
            FragStrategy::IpFrag => "ip_frag",
            FragStrategy::TlsRecordSplit => "tls_record_split",
            FragStrategy::Oob => "oob",
            FragStrategy::Overlap => "overlap",
            FragStrategy::Disorder => "disorder",
            FragStrategy::Combo => "combo",
            FragStrategy::ExtensionSplit => "extension_split",
        }
    }
}

/// Send order for disorder and combo pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    /// Uniformly random permutation
    #[default]
    Random,
    /// Last piece first
    Reverse,
    /// First and last pieces keep their place, the middle is shuffled
    MiddleRandom,
}

/// Fragmentation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentationConfig {
    /// Strategy
    pub strategy: FragStrategy,
    /// Split offset into the TCP payload
    pub position: usize,
    /// Split at the middle of the SNI hostname instead of `position`
    pub middle_sni: bool,
    /// Transmit the later half first
    pub reverse: bool,
    /// Offset inside the TLS record body for record splitting (default: the
    /// start of the `server_name` extension)
    pub record_split_position: Option<usize>,
    /// Same-length hostname written into the overlapped segment
    pub overlap_decoy: String,
    /// Extra split points for disorder and combo
    pub extra_positions: Vec<usize>,
    /// Piece order for disorder and combo
    pub shuffle: ShuffleMode,
    /// Combo pause after the first piece (milliseconds)
    pub combo_pause_ms: u64,
    /// Combo: send a decoy before every piece
    pub combo_decoys: bool,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            strategy: FragStrategy::TcpFrag,
            position: 1,
            middle_sni: false,
            reverse: false,
            record_split_position: None,
            overlap_decoy: "www.w3.org".to_string(),
            extra_positions: Vec::new(),
            shuffle: ShuffleMode::Random,
            combo_pause_ms: 10,
            combo_decoys: false,
        }
    }
}

/// Where fake packets sit in sequence space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeqStrategy {
    /// `seq - len(fake)`: already acknowledged data from the server's view
    #[default]
    PastSeq,
    /// `seq + random offset`: outside the receive window
    RandSeq,
    /// Same sequence as the real segment; relies on a short TTL
    Ttl,
}

/// Payload carried by fake packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakePayloadKind {
    /// Canned ClientHello for the decoy host, no extras
    #[default]
    Default1,
    /// Canned ClientHello for the decoy host with ALPN and randomized fields
    Default2,
    /// Random bytes of ClientHello-like size
    Random,
    /// Operator-supplied hex payload
    Custom,
}

/// Fake ClientHello injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeConfig {
    /// Enable fake injection before the real segments
    pub enabled: bool,
    /// TTL / hop limit of fakes
    pub ttl: u8,
    /// Sequence placement
    pub seq_strategy: SeqStrategy,
    /// Corrupt the transport checksum of fakes
    pub bad_checksum: bool,
    /// Fakes per real ClientHello
    pub repeat: u8,
    /// Payload kind
    pub payload: FakePayloadKind,
    /// Hex payload for [`FakePayloadKind::Custom`]
    pub custom_hex: Option<String>,
    /// Hostname used in canned fakes
    pub decoy_host: String,
    /// Also send payload-carrying decoy SYNs when a SYN to a target is seen
    pub syn_fake: bool,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: 3,
            seq_strategy: SeqStrategy::PastSeq,
            bad_checksum: false,
            repeat: 1,
            payload: FakePayloadKind::Default1,
            custom_hex: None,
            decoy_host: "www.w3.org".to_string(),
            syn_fake: false,
        }
    }
}

/// Control packets sent before the real segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncMode {
    /// RST
    #[default]
    Rst,
    /// FIN
    Fin,
    /// Bare ACK
    Ack,
    /// RST, FIN and ACK
    Combo,
}

/// Desync control-packet injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesyncConfig {
    /// Enable
    pub enabled: bool,
    /// Which control packets
    pub mode: DesyncMode,
    /// TTL / hop limit of control packets
    pub ttl: u8,
    /// Corrupt the transport checksum
    pub bad_checksum: bool,
}

impl Default for DesyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DesyncMode::Rst,
            ttl: 3,
            bad_checksum: true,
        }
    }
}

/// ClientHello mutation before fragmentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Enable
    pub enabled: bool,
    /// Insert GREASE extensions
    pub grease: bool,
    /// Padding extension body length (0 = none)
    pub padding: usize,
    /// Hostnames carried in decoy extensions
    pub decoy_hosts: Vec<String>,
    /// Add an ALPN extension when the ClientHello has none
    pub add_alpn: bool,
    /// Shuffle extension order (`pre_shared_key` stays last)
    pub reorder: bool,
    /// Mutated payloads larger than this are discarded
    pub max_size: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            grease: true,
            padding: 0,
            decoy_hosts: Vec::new(),
            add_alpn: false,
            reorder: false,
            max_size: 1400,
        }
    }
}

/// Inter-packet timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay between real segments (milliseconds)
    pub segment_delay_ms: u64,
    /// Lower jitter bound for disorder pieces (microseconds)
    pub jitter_min_us: u64,
    /// Upper jitter bound for disorder pieces (microseconds)
    pub jitter_max_us: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            segment_delay_ms: 0,
            jitter_min_us: 100,
            jitter_max_us: 1000,
        }
    }
}

/// DNS bypass: redirect lookups for target names to another resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsBypassConfig {
    /// Enable
    pub enabled: bool,
    /// Resolver that receives redirected queries
    pub resolver: Option<IpAddr>,
    /// Resolver port
    pub port: u16,
}

impl Default for DnsBypassConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            resolver: None,
            port: 53,
        }
    }
}

/// All evasion parameters for one target set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvasionConfig {
    /// Fragmentation
    pub fragmentation: FragmentationConfig,
    /// Fake injection
    pub fake: FakeConfig,
    /// Desync control packets
    pub desync: DesyncConfig,
    /// ClientHello mutation
    pub mutation: MutationConfig,
    /// Timing
    pub timing: TimingConfig,
    /// DNS bypass
    pub dns: DnsBypassConfig,
}

impl EvasionConfig {
    /// Check parameter combinations; `prefix` names the set in errors
    pub fn validate(&self, prefix: &str) -> Result<()> {
        let frag = &self.fragmentation;
        if frag.position == 0 && !frag.middle_sni && frag.strategy != FragStrategy::None {
            return Err(Error::config_value(
                format!("{prefix}.fragmentation.position"),
                "Must be at least 1",
            ));
        }
        if frag.strategy == FragStrategy::Overlap && frag.overlap_decoy.is_empty() {
            return Err(Error::config_value(
                format!("{prefix}.fragmentation.overlap_decoy"),
                "Overlap needs a decoy hostname",
            ));
        }
        if frag.extra_positions.contains(&0) {
            return Err(Error::config_value(
                format!("{prefix}.fragmentation.extra_positions"),
                "Positions must be at least 1",
            ));
        }

        if self.fake.enabled || self.fake.syn_fake {
            if self.fake.ttl == 0 {
                return Err(Error::config_value(format!("{prefix}.fake.ttl"), "Must be 1-255"));
            }
            if self.fake.repeat == 0 {
                return Err(Error::config_value(
                    format!("{prefix}.fake.repeat"),
                    "Must be at least 1",
                ));
            }
            if self.fake.payload == FakePayloadKind::Custom {
                let hex_payload = self.fake.custom_hex.as_deref().unwrap_or_default();
                let bytes = hex::decode(hex_payload.trim()).map_err(|e| {
                    Error::config_value(format!("{prefix}.fake.custom_hex"), e.to_string())
                })?;
                if bytes.is_empty() {
                    return Err(Error::config_value(
                        format!("{prefix}.fake.custom_hex"),
                        "Custom payload is empty",
                    ));
                }
            }
        }

        if self.desync.enabled && self.desync.ttl == 0 {
            return Err(Error::config_value(format!("{prefix}.desync.ttl"), "Must be 1-255"));
        }

        if self.timing.jitter_min_us > self.timing.jitter_max_us {
            return Err(Error::config_value(
                format!("{prefix}.timing"),
                "jitter_min_us must not exceed jitter_max_us",
            ));
        }

        if self.dns.enabled {
            if self.dns.resolver.is_none() {
                return Err(Error::config_value(
                    format!("{prefix}.dns.resolver"),
                    "DNS bypass needs a resolver address",
                ));
            }
            if self.dns.port == 0 {
                return Err(Error::config_value(format!("{prefix}.dns.port"), "Must be 1-65535"));
            }
        }

        Ok(())
    }

    /// Decoded custom fake payload, if configured
    pub fn custom_fake_payload(&self) -> Result<Option<Vec<u8>>> {
        match (&self.fake.payload, &self.fake.custom_hex) {
            (FakePayloadKind::Custom, Some(hex_payload)) => Ok(Some(hex::decode(hex_payload.trim())?)),
            _ => Ok(None),
        }
    }
}
