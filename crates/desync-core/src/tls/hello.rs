//! ClientHello construction
//!
//! Produces browser-shaped ClientHello messages. Used for decoy payloads
//! sent by the faking layer and by tests.

use super::{CONTENT_HANDSHAKE, EXT_ALPN, EXT_SERVER_NAME, HANDSHAKE_CLIENT_HELLO};
use bytes::{BufMut, BytesMut};

const CIPHER_SUITES: &[u16] = &[
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
    0x009c, 0x009d, 0x002f, 0x0035,
];

/// Builder for a TLS 1.3 style ClientHello
#[derive(Debug, Clone)]
pub struct ClientHelloBuilder {
    hostname: Option<String>,
    random: [u8; 32],
    session_id: [u8; 32],
    key_share: [u8; 32],
    alpn: bool,
    extra: Vec<(u16, Vec<u8>)>,
}

impl ClientHelloBuilder {
    /// ClientHello carrying `hostname` in its SNI extension
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            random: [0x5c; 32],
            session_id: [0xe3; 32],
            key_share: [0x2a; 32],
            alpn: true,
            extra: Vec::new(),
        }
    }

    /// ClientHello without a `server_name` extension
    pub fn without_sni() -> Self {
        Self {
            hostname: None,
            ..Self::new("")
        }
    }

    /// Use the given random, session id and key share bytes
    pub fn entropy(mut self, random: [u8; 32], session_id: [u8; 32], key_share: [u8; 32]) -> Self {
        self.random = random;
        self.session_id = session_id;
        self.key_share = key_share;
        self
    }

    /// Fill random, session id and key share from the thread RNG
    pub fn randomized(self) -> Self {
        self.entropy(rand::random(), rand::random(), rand::random())
    }

    /// Include or omit the ALPN extension
    pub fn alpn(mut self, enabled: bool) -> Self {
        self.alpn = enabled;
        self
    }

    /// Append an arbitrary extension after the standard ones
    pub fn extension(mut self, ext_type: u16, data: Vec<u8>) -> Self {
        self.extra.push((ext_type, data));
        self
    }

    #[allow(clippy::cast_possible_truncation)]
    fn extensions(&self) -> BytesMut {
        let mut ext = BytesMut::new();
        let mut put = |ext_type: u16, data: &[u8]| {
            ext.put_u16(ext_type);
            ext.put_u16(data.len() as u16);
            ext.extend_from_slice(data);
        };

        if let Some(host) = &self.hostname {
            put(EXT_SERVER_NAME, &server_name_body(host.as_bytes()));
        }
        put(0x0017, &[]); // extended_master_secret
        put(0xff01, &[0x00]); // renegotiation_info
        put(0x000a, &[0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]); // supported_groups
        put(0x000b, &[0x01, 0x00]); // ec_point_formats
        if self.alpn {
            put(EXT_ALPN, &alpn_body(&[b"h2", b"http/1.1"]));
        }
        put(
            0x000d,
            &[
                0x00, 0x10, 0x04, 0x03, 0x08, 0x04, 0x04, 0x01, 0x05, 0x03, 0x08, 0x05, 0x05, 0x01,
                0x08, 0x06, 0x06, 0x01,
            ],
        ); // signature_algorithms
        let mut key_share = vec![0x00, 0x24, 0x00, 0x1d, 0x00, 0x20];
        key_share.extend_from_slice(&self.key_share);
        put(0x0033, &key_share);
        put(0x002d, &[0x01, 0x01]); // psk_key_exchange_modes
        put(0x002b, &[0x04, 0x03, 0x04, 0x03, 0x03]); // supported_versions
        for (ext_type, data) in &self.extra {
            put(*ext_type, data);
        }
        ext
    }

    /// Bare handshake message (as carried in QUIC CRYPTO frames)
    #[allow(clippy::cast_possible_truncation)]
    pub fn build_handshake(&self) -> Vec<u8> {
        let ext = self.extensions();
        let mut body = BytesMut::new();
        body.put_u16(0x0303);
        body.extend_from_slice(&self.random);
        body.put_u8(32);
        body.extend_from_slice(&self.session_id);
        body.put_u16((CIPHER_SUITES.len() * 2) as u16);
        for suite in CIPHER_SUITES {
            body.put_u16(*suite);
        }
        body.put_u8(1);
        body.put_u8(0);
        body.put_u16(ext.len() as u16);
        body.extend_from_slice(&ext);

        let mut hs = BytesMut::with_capacity(body.len() + 4);
        hs.put_u8(HANDSHAKE_CLIENT_HELLO);
        hs.put_uint(body.len() as u64, 3);
        hs.extend_from_slice(&body);
        hs.to_vec()
    }

    /// Handshake wrapped in a single TLS record
    #[allow(clippy::cast_possible_truncation)]
    pub fn build_record(&self) -> Vec<u8> {
        let hs = self.build_handshake();
        let mut rec = BytesMut::with_capacity(hs.len() + 5);
        rec.put_u8(CONTENT_HANDSHAKE);
        rec.put_u16(0x0301);
        rec.put_u16(hs.len() as u16);
        rec.extend_from_slice(&hs);
        rec.to_vec()
    }
}

/// Body of a `server_name` extension with one host_name entry
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn server_name_body(host: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 5);
    body.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    body.push(0);
    body.extend_from_slice(&(host.len() as u16).to_be_bytes());
    body.extend_from_slice(host);
    body
}

/// Body of an ALPN extension
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn alpn_body(protocols: &[&[u8]]) -> Vec<u8> {
    let list: Vec<u8> = protocols
        .iter()
        .flat_map(|p| std::iter::once(p.len() as u8).chain(p.iter().copied()))
        .collect();
    let mut body = Vec::with_capacity(list.len() + 2);
    body.extend_from_slice(&(list.len() as u16).to_be_bytes());
    body.extend_from_slice(&list);
    body
}
