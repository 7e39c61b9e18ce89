//! ClientHello mutation
//!
//! Rewrites the extension list of a whole ClientHello record: GREASE
//! entries, decoy hostnames, a padding extension, a missing ALPN list or a
//! shuffled order. The extension list, handshake and record lengths are
//! recomputed. When the result is larger than allowed, no mutation is
//! applied.

use crate::config::MutationConfig;
use crate::tls::{
    self, ClientHelloLayout, EXT_ALPN, EXT_PADDING, EXT_PRE_SHARED_KEY, EXT_SERVER_NAME,
    RECORD_HEADER_LEN,
};
use rand::seq::SliceRandom;
use tracing::trace;

/// GREASE values reserved by RFC 8701
const GREASE: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// GREASE types not yet used by the ClientHello, drawn without replacement
/// so no extension type appears twice
struct GreasePool(Vec<u16>);

impl GreasePool {
    fn new(layout: &ClientHelloLayout) -> Self {
        let mut pool: Vec<u16> = GREASE
            .iter()
            .copied()
            .filter(|t| !layout.has_extension(*t))
            .collect();
        pool.shuffle(&mut rand::thread_rng());
        Self(pool)
    }

    fn take(&mut self) -> Option<u16> {
        self.0.pop()
    }
}

#[derive(Debug, Clone)]
struct Extension {
    ext_type: u16,
    body: Vec<u8>,
}

/// Mutate a whole ClientHello record. Returns `None` when the layout does
/// not describe a record at offset zero, when nothing changed, or when the
/// mutated record would exceed `cfg.max_size`.
#[allow(clippy::cast_possible_truncation)]
pub fn mutate(payload: &[u8], layout: &ClientHelloLayout, cfg: &MutationConfig) -> Option<Vec<u8>> {
    if !layout.is_whole() || layout.end > payload.len() {
        return None;
    }

    let mut extensions: Vec<Extension> = layout
        .extensions
        .iter()
        .map(|e| Extension {
            ext_type: e.ext_type,
            body: payload[e.start + 4..e.end()].to_vec(),
        })
        .collect();
    let original_count = extensions.len();

    // pre_shared_key must remain the final extension
    let psk = extensions
        .iter()
        .position(|e| e.ext_type == EXT_PRE_SHARED_KEY)
        .map(|i| extensions.remove(i));

    let mut grease = GreasePool::new(layout);

    if !cfg.decoy_hosts.is_empty() {
        let at = extensions
            .iter()
            .position(|e| e.ext_type == EXT_SERVER_NAME)
            .unwrap_or(0);
        for host in cfg.decoy_hosts.iter().rev() {
            let Some(ext_type) = grease.take() else {
                break;
            };
            extensions.insert(
                at,
                Extension {
                    ext_type,
                    body: tls::server_name_body(host.as_bytes()),
                },
            );
        }
    }

    if cfg.add_alpn && !layout.has_extension(EXT_ALPN) {
        extensions.push(Extension {
            ext_type: EXT_ALPN,
            body: tls::alpn_body(&[b"h2", b"http/1.1"]),
        });
    }

    if cfg.reorder {
        extensions.shuffle(&mut rand::thread_rng());
    }

    if cfg.grease {
        if let Some(ext_type) = grease.take() {
            extensions.insert(
                0,
                Extension {
                    ext_type,
                    body: Vec::new(),
                },
            );
        }
        if let Some(ext_type) = grease.take() {
            extensions.push(Extension {
                ext_type,
                body: vec![0x00],
            });
        }
    }

    if cfg.padding > 0 && !layout.has_extension(EXT_PADDING) {
        extensions.push(Extension {
            ext_type: EXT_PADDING,
            body: vec![0; cfg.padding],
        });
    }

    extensions.extend(psk);

    if extensions.len() == original_count && !cfg.reorder {
        return None;
    }

    let mut ext_bytes = Vec::new();
    for ext in &extensions {
        ext_bytes.extend_from_slice(&ext.ext_type.to_be_bytes());
        ext_bytes.extend_from_slice(&(ext.body.len() as u16).to_be_bytes());
        ext_bytes.extend_from_slice(&ext.body);
    }
    if ext_bytes.len() > usize::from(u16::MAX) {
        return None;
    }

    // version, random, session id, cipher suites, compression
    let fixed = &payload[layout.handshake_start + 4..layout.extensions_len_at];
    let body_len = fixed.len() + 2 + ext_bytes.len();
    let record_len = 4 + body_len;
    let total = RECORD_HEADER_LEN + record_len + (payload.len() - layout.end);
    if record_len > usize::from(u16::MAX) || total > cfg.max_size {
        trace!(total, max = cfg.max_size, "mutated ClientHello too large, not mutating");
        return None;
    }

    let mut out = Vec::with_capacity(total);
    out.push(payload[0]);
    out.extend_from_slice(&payload[1..3]);
    out.extend_from_slice(&(record_len as u16).to_be_bytes());
    out.push(tls::HANDSHAKE_CLIENT_HELLO);
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(fixed);
    out.extend_from_slice(&(ext_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&ext_bytes);
    out.extend_from_slice(&payload[layout.end..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{parse_record, ClientHelloBuilder, Extraction};

    fn layout(record: &[u8]) -> ClientHelloLayout {
        match parse_record(record) {
            Extraction::Parsed(layout) => layout,
            other => panic!("expected ClientHello, got {other:?}"),
        }
    }

    fn enabled() -> MutationConfig {
        MutationConfig {
            enabled: true,
            ..MutationConfig::default()
        }
    }

    #[test]
    fn test_grease_keeps_hostname_and_lengths() {
        let record = ClientHelloBuilder::new("www.example.com").build_record();
        let mutated = mutate(&record, &layout(&record), &enabled()).unwrap();

        let new_layout = layout(&mutated);
        assert_eq!(new_layout.hostname.as_deref(), Some("www.example.com"));
        assert_eq!(new_layout.extensions.len(), layout(&record).extensions.len() + 2);
        assert!(GREASE.contains(&new_layout.extensions[0].ext_type));
        let types: std::collections::HashSet<u16> =
            new_layout.extensions.iter().map(|e| e.ext_type).collect();
        assert_eq!(types.len(), new_layout.extensions.len());
        assert_eq!(new_layout.end, mutated.len());
    }

    #[test]
    fn test_decoy_precedes_real_sni() {
        let record = ClientHelloBuilder::new("blocked.example").build_record();
        let cfg = MutationConfig {
            grease: false,
            decoy_hosts: vec!["allowed.example".into()],
            ..enabled()
        };
        let mutated = mutate(&record, &layout(&record), &cfg).unwrap();
        let new_layout = layout(&mutated);

        assert_eq!(new_layout.hostname.as_deref(), Some("blocked.example"));
        let decoy_at = mutated
            .windows(15)
            .position(|w| w == b"allowed.example")
            .unwrap();
        assert!(decoy_at < new_layout.sni.unwrap().host_start);
    }

    #[test]
    fn test_psk_stays_last_after_reorder() {
        let record = ClientHelloBuilder::new("www.example.com")
            .extension(EXT_PRE_SHARED_KEY, vec![0x00, 0x00, 0x00, 0x00])
            .build_record();
        let cfg = MutationConfig {
            reorder: true,
            padding: 32,
            ..enabled()
        };
        for _ in 0..16 {
            let mutated = mutate(&record, &layout(&record), &cfg).unwrap();
            let new_layout = layout(&mutated);
            assert_eq!(new_layout.extensions.last().unwrap().ext_type, EXT_PRE_SHARED_KEY);
            assert!(new_layout.has_extension(EXT_PADDING));
        }
    }

    #[test]
    fn test_alpn_added_only_when_missing() {
        let without = ClientHelloBuilder::new("www.example.com").alpn(false).build_record();
        let cfg = MutationConfig {
            grease: false,
            add_alpn: true,
            ..enabled()
        };
        let mutated = mutate(&without, &layout(&without), &cfg).unwrap();
        assert!(layout(&mutated).has_extension(EXT_ALPN));

        let with = ClientHelloBuilder::new("www.example.com").build_record();
        assert!(mutate(&with, &layout(&with), &cfg).is_none());
    }

    #[test]
    fn test_oversized_result_rejected() {
        let record = ClientHelloBuilder::new("www.example.com").build_record();
        let cfg = MutationConfig {
            padding: 2000,
            max_size: 1400,
            ..enabled()
        };
        assert!(mutate(&record, &layout(&record), &cfg).is_none());
    }

    #[test]
    fn test_partial_segment_not_mutated() {
        let record = ClientHelloBuilder::new("www.example.com").build_record();
        let rebased = layout(&record).rebase(10).unwrap();
        assert!(mutate(&record[10..], &rebased, &enabled()).is_none());
    }
}
