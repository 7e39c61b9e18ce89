//! Strategy families and their presets
//!
//! Each family maps to a representative [`EvasionConfig`], used by discovery
//! for the first survey and by `desync config generate --family`. Families
//! without a tunable number carry a short list of fixed presets instead.

use super::evasion::{
    DesyncMode, EvasionConfig, FakePayloadKind, FragStrategy, SeqStrategy, ShuffleMode,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Family of evasion techniques
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyFamily {
    /// Fake ClientHello with a decoy SNI
    FakeSni,
    /// TCP segmentation
    TcpFrag,
    /// TLS record splitting
    TlsRecordSplit,
    /// IP fragmentation
    IpFrag,
    /// Urgent-pointer split
    Oob,
    /// Overlapping segments
    Overlap,
    /// Out-of-order pieces
    Disorder,
    /// First piece, pause, shuffled rest
    Combo,
    /// Split before the `server_name` extension
    ExtensionSplit,
    /// Payload-carrying decoy SYNs
    SynFake,
    /// ClientHello extension mutation
    SniMutation,
    /// RST/FIN/ACK control packets
    Desync,
    /// Fake plus fragmentation
    Hybrid,
    /// No bypass
    None,
}

/// The numeric knob a family is optimized along
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunableParameter {
    /// TTL of injected packets
    FakeTtl,
    /// Split offset into the payload
    SplitPosition,
}

impl StrategyFamily {
    /// Families a discovery survey tries, in default order
    pub const SURVEY: [StrategyFamily; 13] = [
        StrategyFamily::TcpFrag,
        StrategyFamily::TlsRecordSplit,
        StrategyFamily::FakeSni,
        StrategyFamily::ExtensionSplit,
        StrategyFamily::Disorder,
        StrategyFamily::Oob,
        StrategyFamily::Desync,
        StrategyFamily::IpFrag,
        StrategyFamily::Combo,
        StrategyFamily::SniMutation,
        StrategyFamily::SynFake,
        StrategyFamily::Overlap,
        StrategyFamily::Hybrid,
    ];

    /// Short name
    pub fn name(self) -> &'static str {
        match self {
            StrategyFamily::FakeSni => "fake_sni",
            StrategyFamily::TcpFrag => "tcp_frag",
            StrategyFamily::TlsRecordSplit => "tls_record_split",
            StrategyFamily::IpFrag => "ip_frag",
            StrategyFamily::Oob => "oob",
            StrategyFamily::Overlap => "overlap",
            StrategyFamily::Disorder => "disorder",
            StrategyFamily::Combo => "combo",
            StrategyFamily::ExtensionSplit => "extension_split",
            StrategyFamily::SynFake => "syn_fake",
            StrategyFamily::SniMutation => "sni_mutation",
            StrategyFamily::Desync => "desync",
            StrategyFamily::Hybrid => "hybrid",
            StrategyFamily::None => "none",
        }
    }

    /// Parameter optimized by binary search, if any
    pub fn tunable(self) -> Option<TunableParameter> {
        match self {
            StrategyFamily::FakeSni
            | StrategyFamily::SynFake
            | StrategyFamily::Desync
            | StrategyFamily::Hybrid => Some(TunableParameter::FakeTtl),
            StrategyFamily::TcpFrag | StrategyFamily::Oob | StrategyFamily::IpFrag => {
                Some(TunableParameter::SplitPosition)
            }
            _ => None,
        }
    }

    /// Representative configuration for this family
    pub fn into_config(self) -> EvasionConfig {
        let mut config = EvasionConfig::default();

        match self {
            StrategyFamily::None => {
                config.fragmentation.strategy = FragStrategy::None;
            }
            StrategyFamily::TcpFrag => {
                config.fragmentation.strategy = FragStrategy::TcpFrag;
                config.fragmentation.position = 1;
            }
            StrategyFamily::TlsRecordSplit => {
                config.fragmentation.strategy = FragStrategy::TlsRecordSplit;
            }
            StrategyFamily::IpFrag => {
                config.fragmentation.strategy = FragStrategy::IpFrag;
                config.fragmentation.position = 8;
            }
            StrategyFamily::Oob => {
                config.fragmentation.strategy = FragStrategy::Oob;
                config.fragmentation.position = 1;
            }
            StrategyFamily::Overlap => {
                config.fragmentation.strategy = FragStrategy::Overlap;
            }
            StrategyFamily::Disorder => {
                config.fragmentation.strategy = FragStrategy::Disorder;
                config.fragmentation.shuffle = ShuffleMode::Reverse;
            }
            StrategyFamily::Combo => {
                config.fragmentation.strategy = FragStrategy::Combo;
                config.fragmentation.combo_pause_ms = 10;
            }
            StrategyFamily::ExtensionSplit => {
                config.fragmentation.strategy = FragStrategy::ExtensionSplit;
            }
            StrategyFamily::FakeSni => {
                config.fragmentation.strategy = FragStrategy::None;
                config.fake.enabled = true;
                config.fake.ttl = 3;
                config.fake.seq_strategy = SeqStrategy::Ttl;
            }
            StrategyFamily::SynFake => {
                config.fragmentation.strategy = FragStrategy::None;
                config.fake.syn_fake = true;
                config.fake.ttl = 3;
            }
            StrategyFamily::SniMutation => {
                config.fragmentation.strategy = FragStrategy::TcpFrag;
                config.mutation.enabled = true;
                config.mutation.grease = true;
                config.mutation.padding = 256;
            }
            StrategyFamily::Desync => {
                config.fragmentation.strategy = FragStrategy::None;
                config.desync.enabled = true;
                config.desync.mode = DesyncMode::Rst;
                config.desync.ttl = 3;
            }
            StrategyFamily::Hybrid => {
                config.fragmentation.strategy = FragStrategy::TcpFrag;
                config.fragmentation.middle_sni = true;
                config.fake.enabled = true;
                config.fake.ttl = 3;
                config.fake.seq_strategy = SeqStrategy::PastSeq;
                config.fake.bad_checksum = true;
            }
        }

        config
    }

    /// Fixed presets tried when the family has no tunable parameter
    pub fn presets(self) -> Vec<EvasionConfig> {
        let base = self.into_config();
        let mut out = vec![base.clone()];
        match self {
            StrategyFamily::TlsRecordSplit => {
                for at in [1, 16] {
                    let mut c = base.clone();
                    c.fragmentation.record_split_position = Some(at);
                    out.push(c);
                }
            }
            StrategyFamily::Disorder | StrategyFamily::Combo => {
                for shuffle in [ShuffleMode::Random, ShuffleMode::MiddleRandom] {
                    let mut c = base.clone();
                    c.fragmentation.shuffle = shuffle;
                    out.push(c);
                }
                let mut c = base.clone();
                c.fragmentation.extra_positions = vec![2, 8];
                out.push(c);
            }
            StrategyFamily::ExtensionSplit => {
                let mut c = base.clone();
                c.fragmentation.reverse = true;
                out.push(c);
            }
            StrategyFamily::SniMutation => {
                let mut c = base.clone();
                c.mutation.reorder = true;
                c.mutation.add_alpn = true;
                out.push(c);
                let mut c = base.clone();
                c.mutation.decoy_hosts = vec!["www.w3.org".to_string()];
                out.push(c);
            }
            StrategyFamily::Overlap => {
                let mut c = base.clone();
                c.fragmentation.reverse = true;
                out.push(c);
            }
            _ => {}
        }
        out
    }

    /// Representative config using a specific fake payload
    pub fn with_fake_payload(self, payload: FakePayloadKind) -> EvasionConfig {
        let mut config = self.into_config();
        config.fake.payload = payload;
        config
    }
}

impl fmt::Display for StrategyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyFamily {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StrategyFamily::SURVEY
            .into_iter()
            .chain([StrategyFamily::None])
            .find(|f| f.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown strategy family '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_preset_validates() {
        for family in StrategyFamily::SURVEY {
            for (i, preset) in family.presets().iter().enumerate() {
                assert!(
                    preset.validate(&format!("{family}[{i}]")).is_ok(),
                    "{family} preset {i} invalid"
                );
            }
        }
    }

    #[test]
    fn test_name_roundtrip() {
        for family in StrategyFamily::SURVEY {
            assert_eq!(family.name().parse::<StrategyFamily>().unwrap(), family);
        }
        assert!("bogus".parse::<StrategyFamily>().is_err());
    }

    #[test]
    fn test_tcp_frag_representative() {
        let c = StrategyFamily::TcpFrag.into_config();
        assert_eq!(c.fragmentation.strategy, FragStrategy::TcpFrag);
        assert_eq!(c.fragmentation.position, 1);
        assert!(!c.fake.enabled);
    }

    #[test]
    fn test_tunable_families() {
        assert_eq!(StrategyFamily::FakeSni.tunable(), Some(TunableParameter::FakeTtl));
        assert_eq!(StrategyFamily::TcpFrag.tunable(), Some(TunableParameter::SplitPosition));
        assert_eq!(StrategyFamily::Disorder.tunable(), None);
        assert!(StrategyFamily::Disorder.presets().len() > 1);
    }
}
