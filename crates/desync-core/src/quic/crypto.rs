//! QUIC Initial packet protection (RFC 9001 §5)
//!
//! Initial keys are derived from the client's destination connection ID and
//! a version-specific salt, so any observer can remove the protection.

use super::{InitialHeader, QUIC_V2};
use crate::error::{Error, Result};
use ring::{aead, hkdf};

const SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];
const SALT_V2: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];

struct Len(usize);

impl hkdf::KeyType for Len {
    fn len(&self) -> usize {
        self.0
    }
}

/// Client-side Initial keys
pub struct InitialKeys {
    /// AEAD key (AES-128-GCM)
    pub key: [u8; 16],
    /// AEAD IV
    pub iv: [u8; 12],
    /// Header protection key
    pub hp: [u8; 16],
}

#[allow(clippy::cast_possible_truncation)]
fn expand_label(prk: &hkdf::Prk, label: &str, out: &mut [u8]) -> Result<()> {
    let full = format!("tls13 {label}");
    let len = (out.len() as u16).to_be_bytes();
    let label_len = [full.len() as u8];
    let ctx_len = [0u8];
    let info: [&[u8]; 4] = [&len, &label_len, full.as_bytes(), &ctx_len];
    prk.expand(&info, Len(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| Error::QuicDecrypt("hkdf expand"))
}

impl InitialKeys {
    /// Derive the client Initial keys for `dcid`
    pub fn client(version: u32, dcid: &[u8]) -> Result<Self> {
        let (salt, prefix) = if version == QUIC_V2 {
            (&SALT_V2, "quicv2")
        } else {
            (&SALT_V1, "quic")
        };
        let initial = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(dcid);

        let mut secret = [0u8; 32];
        expand_label(&initial, "client in", &mut secret)?;
        let client = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secret);

        let mut keys = Self {
            key: [0; 16],
            iv: [0; 12],
            hp: [0; 16],
        };
        expand_label(&client, &format!("{prefix} key"), &mut keys.key)?;
        expand_label(&client, &format!("{prefix} iv"), &mut keys.iv)?;
        expand_label(&client, &format!("{prefix} hp"), &mut keys.hp)?;
        Ok(keys)
    }

    /// Header protection mask for a 16-byte ciphertext sample
    pub fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        let hp = aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &self.hp)
            .map_err(|_| Error::QuicDecrypt("header protection key"))?;
        hp.new_mask(sample)
            .map_err(|_| Error::QuicDecrypt("header protection sample"))
    }

    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (i, b) in packet_number.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= b;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

/// Remove header protection and decrypt one client Initial packet.
/// Returns the plaintext frame bytes.
pub fn open_initial(datagram: &[u8], header: &InitialHeader) -> Result<Vec<u8>> {
    let keys = InitialKeys::client(header.version, &header.dcid)?;
    let pn_offset = header.pn_offset;
    let end = pn_offset + header.length;
    if end > datagram.len() || pn_offset + 4 + 16 > end {
        return Err(Error::QuicDecrypt("packet shorter than sample"));
    }

    let mask = keys.mask(&datagram[pn_offset + 4..pn_offset + 20])?;
    let mut packet = datagram[..end].to_vec();
    packet[0] ^= mask[0] & 0x0f;
    let pn_len = usize::from(packet[0] & 0x03) + 1;
    let mut packet_number = 0u64;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
        packet_number = (packet_number << 8) | u64::from(packet[pn_offset + i]);
    }

    let payload_start = pn_offset + pn_len;
    let (aad, payload) = packet.split_at_mut(payload_start);
    let key = aead::UnboundKey::new(&aead::AES_128_GCM, &keys.key)
        .map_err(|_| Error::QuicDecrypt("aead key"))?;
    let key = aead::LessSafeKey::new(key);
    let plain = key
        .open_in_place(keys.nonce(packet_number), aead::Aad::from(&*aad), payload)
        .map_err(|_| Error::QuicDecrypt("aead open"))?;
    Ok(plain.to_vec())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::quic::{parse_initial, QUIC_V1};

    /// Build a protected client Initial around `frames` (inverse of
    /// [`open_initial`])
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn seal_initial(dcid: &[u8], packet_number: u8, frames: &[u8]) -> Vec<u8> {
        let keys = InitialKeys::client(QUIC_V1, dcid).unwrap();
        let mut plain = frames.to_vec();
        // Pad so the sample is always available and the datagram is 1200+
        if plain.len() < 1162 {
            plain.resize(1162, 0);
        }

        let mut header = vec![0xc0]; // long, fixed, Initial, pn_len 1
        header.extend_from_slice(&QUIC_V1.to_be_bytes());
        header.push(dcid.len() as u8);
        header.extend_from_slice(dcid);
        header.push(0); // scid len
        header.push(0); // token len
        let length = 1 + plain.len() + 16;
        header.extend_from_slice(&(0x4000 | length as u16).to_be_bytes());
        let pn_offset = header.len();
        header.push(packet_number);

        let key = aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &keys.key).unwrap());
        key.seal_in_place_append_tag(
            keys.nonce(u64::from(packet_number)),
            aead::Aad::from(&header[..]),
            &mut plain,
        )
        .unwrap();

        let mut packet = header;
        packet.extend_from_slice(&plain);
        let mask = keys.mask(&packet[pn_offset + 4..pn_offset + 20]).unwrap();
        packet[0] ^= mask[0] & 0x0f;
        packet[pn_offset] ^= mask[1];
        packet
    }

    #[test]
    fn test_rfc9001_client_keys() {
        let dcid = hex::decode("8394c8f03e515708").unwrap();
        let keys = InitialKeys::client(QUIC_V1, &dcid).unwrap();
        assert_eq!(hex::encode(keys.key), "1f369613dd76d5467730efcbe3b1a22d");
        assert_eq!(hex::encode(keys.iv), "fa044b2f42a3fd3b46fb255c");
        assert_eq!(hex::encode(keys.hp), "9f50449e04a0e810283a1e9933adedd2");
    }

    #[test]
    fn test_seal_then_open() {
        let dcid = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let frames = [0x01, 0x06, 0x00, 0x03, 0xAA, 0xBB, 0xCC];
        let datagram = seal_initial(&dcid, 0, &frames);

        let header = parse_initial(&datagram).unwrap();
        let plain = open_initial(&datagram, &header).unwrap();
        assert_eq!(&plain[..frames.len()], &frames);
    }

    #[test]
    fn test_open_rejects_tampering() {
        let dcid = [9u8; 8];
        let mut datagram = seal_initial(&dcid, 1, &[0x01]);
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;
        let header = parse_initial(&datagram).unwrap();
        assert!(open_initial(&datagram, &header).is_err());
    }
}
