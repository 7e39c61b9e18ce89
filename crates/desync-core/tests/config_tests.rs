//! Integration tests for configuration module

use desync_core::config::*;
use desync_core::Error;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};

#[test]
fn test_config_from_family_tcp_frag() {
    let config = Config::from_family(StrategyFamily::TcpFrag, vec!["blocked.example".into()]);
    let set = &config.sets[0];
    assert_eq!(set.name, "tcp_frag");
    assert_eq!(set.evasion.fragmentation.strategy, FragStrategy::TcpFrag);
    assert_eq!(set.evasion.fragmentation.position, 1);
    assert!(!set.evasion.fake.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_from_family_hybrid() {
    let config = Config::from_family(StrategyFamily::Hybrid, vec!["blocked.example".into()]);
    let evasion = &config.sets[0].evasion;
    assert!(evasion.fake.enabled);
    assert!(evasion.fake.bad_checksum);
    assert!(evasion.fragmentation.middle_sni);
}

#[test]
fn test_all_family_presets_valid() {
    for family in StrategyFamily::SURVEY {
        for (i, evasion) in family.presets().into_iter().enumerate() {
            let mut config = Config::default();
            config.sets.push(TargetSetConfig {
                name: format!("{family}-{i}"),
                domains: vec!["blocked.example".into()],
                evasion,
                ..TargetSetConfig::default()
            });
            assert!(config.validate().is_ok(), "{family} preset {i} invalid");
        }
    }
}

#[test]
fn test_family_parsing() {
    assert_eq!("tcp_frag".parse::<StrategyFamily>().unwrap(), StrategyFamily::TcpFrag);
    assert_eq!("fake_sni".parse::<StrategyFamily>().unwrap(), StrategyFamily::FakeSni);
    assert!("carrier_pigeon".parse::<StrategyFamily>().is_err());
}

#[test]
fn test_toml_serialization_roundtrip() {
    let mut config = Config::from_family(StrategyFamily::Combo, vec!["blocked.example".into()]);
    config.sets[0].cidrs.push("203.0.113.0/24".into());
    config.sets[0].evasion.dns.enabled = true;
    config.sets[0].evasion.dns.resolver = Some(IpAddr::V4(Ipv4Addr::new(77, 88, 8, 8)));

    let toml = config.to_toml().unwrap();
    let parsed = Config::from_toml(&toml).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_toml_custom_config() {
    let toml = r#"
[queue]
start = 300
threads = 2

[discovery]
reference_domain = "www.example.org"
ttl_max = 16

[discovery.thresholds]
rst_fast_ms = 20

[[sets]]
name = "video"
domains = ["video.example", "cdn.video.example"]

[sets.evasion.fragmentation]
strategy = "disorder"
shuffle = "middle_random"
extra_positions = [3, 9]

[sets.evasion.fake]
enabled = true
ttl = 5
seq_strategy = "rand_seq"
payload = "custom"
custom_hex = "160301000100"

[[sets]]
name = "fallback"
cidrs = ["198.51.100.0/24"]
"#;

    let config = Config::from_toml(toml).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.queue.queue_numbers().collect::<Vec<_>>(), vec![300, 301]);
    assert_eq!(config.discovery.ttl_max, 16);
    assert_eq!(config.discovery.thresholds.rst_fast_ms, 20);
    assert_eq!(config.discovery.thresholds.rst_slow_ms, 150);

    let video = &config.sets[0].evasion;
    assert_eq!(video.fragmentation.strategy, FragStrategy::Disorder);
    assert_eq!(video.fragmentation.shuffle, ShuffleMode::MiddleRandom);
    assert_eq!(video.fake.seq_strategy, SeqStrategy::RandSeq);
    assert_eq!(
        video.custom_fake_payload().unwrap(),
        Some(vec![0x16, 0x03, 0x01, 0x00, 0x01, 0x00])
    );
    assert_eq!(config.sets[1].evasion, EvasionConfig::default());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[queue]\nthreads = 1\n\n[[sets]]\nname = \"a\"\ndomains = [\"a.example\"]").unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.queue.threads, 1);
    assert!(matches!(
        Config::load("/nonexistent/desync.toml"),
        Err(Error::ConfigNotFound { .. })
    ));
}

#[test]
fn test_config_validation_errors() {
    let mut config = Config::from_family(StrategyFamily::TcpFrag, vec!["a.example".into()]);
    config.queue.threads = 0;
    assert!(config.validate().unwrap_err().is_config());

    let mut config = Config::from_family(StrategyFamily::TcpFrag, vec!["a.example".into()]);
    config.sets.push(config.sets[0].clone());
    assert!(config.validate().is_err());

    let mut config = Config::from_family(StrategyFamily::FakeSni, vec!["a.example".into()]);
    config.sets[0].evasion.fake.ttl = 0;
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("sets[0].fake.ttl"), "{err}");

    let mut config = Config::default();
    config.discovery.ttl_min = 40;
    assert!(config.validate().is_err());
}

// ============ Hot Swap Tests ============

#[test]
fn test_invalid_update_keeps_running_config() {
    let handle =
        ConfigHandle::new(Config::from_family(StrategyFamily::TcpFrag, vec!["a.example".into()]))
            .unwrap();
    let before = handle.generation();

    let mut bad = handle.config();
    bad.sets[0].cidrs.push("not-a-network".into());
    assert!(handle.update(bad).is_err());
    assert_eq!(handle.generation(), before);
    assert!(handle.load().match_host("www.a.example").is_some());

    let good = Config::from_family(StrategyFamily::Oob, vec!["b.example".into()]);
    let generation = handle.update(good).unwrap();
    assert!(generation > before);
    let snapshot = handle.load();
    assert!(snapshot.match_host("a.example").is_none());
    assert_eq!(
        snapshot.match_host("b.example").unwrap().evasion.fragmentation.strategy,
        FragStrategy::Oob
    );
}

#[test]
fn test_snapshot_outlives_update() {
    let handle =
        ConfigHandle::new(Config::from_family(StrategyFamily::TcpFrag, vec!["a.example".into()]))
            .unwrap();
    let old = handle.load();
    handle
        .update(Config::from_family(StrategyFamily::Oob, vec!["b.example".into()]))
        .unwrap();
    assert!(old.match_host("a.example").is_some());
    assert!(handle.load().match_host("a.example").is_none());
}
