//! QUIC Initial SNI extraction
//!
//! A client Initial carries the TLS ClientHello inside CRYPTO frames, often
//! spread over several frames and several datagrams. Extraction is:
//! parse the long header, remove Initial protection, collect CRYPTO frames
//! into a per-DCID [`CryptoReassembler`], then walk the ClientHello once a
//! complete handshake message is available from offset zero.

mod crypto;
mod reassembly;

pub use crypto::{open_initial, InitialKeys};
pub use reassembly::{CryptoReassembler, ReassemblyLimits, MAX_CRYPTO_OFFSET};

use crate::error::{Error, Result};
use crate::tls::{self, Extraction};
use std::time::Instant;
use tracing::trace;

/// QUIC version 1
pub const QUIC_V1: u32 = 0x0000_0001;
/// QUIC version 2
pub const QUIC_V2: u32 = 0x6b33_43cf;

const FRAME_PADDING: u64 = 0x00;
const FRAME_PING: u64 = 0x01;
const FRAME_CRYPTO: u64 = 0x06;

/// Decode a variable-length integer, returning (value, bytes consumed)
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for b in &buf[1..len] {
        value = (value << 8) | u64::from(*b);
    }
    Some((value, len))
}

/// Parsed long header of a client Initial packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHeader {
    /// QUIC version
    pub version: u32,
    /// Destination connection ID
    pub dcid: Vec<u8>,
    /// Source connection ID
    pub scid: Vec<u8>,
    /// Offset of the (protected) packet number
    pub pn_offset: usize,
    /// Value of the Length field: packet number plus payload
    pub length: usize,
}

fn is_initial(first: u8, version: u32) -> bool {
    let packet_type = (first >> 4) & 0x03;
    match version {
        QUIC_V1 => packet_type == 0,
        QUIC_V2 => packet_type == 1,
        _ => false,
    }
}

/// Parse the long header of a QUIC Initial packet
pub fn parse_initial(datagram: &[u8]) -> Result<InitialHeader> {
    let too_short = || Error::packet_parse("QUIC long header truncated");
    let first = *datagram.first().ok_or_else(too_short)?;
    if first & 0xc0 != 0xc0 {
        return Err(Error::packet_parse("not a QUIC long header"));
    }
    let version_bytes = datagram.get(1..5).ok_or_else(too_short)?;
    let version = u32::from_be_bytes([
        version_bytes[0],
        version_bytes[1],
        version_bytes[2],
        version_bytes[3],
    ]);
    if !is_initial(first, version) {
        return Err(Error::packet_parse("not a QUIC Initial packet"));
    }

    let mut pos = 5;
    let dcid_len = usize::from(*datagram.get(pos).ok_or_else(too_short)?);
    if dcid_len > 20 {
        return Err(Error::packet_parse_at("DCID longer than 20 bytes", pos));
    }
    pos += 1;
    let dcid = datagram.get(pos..pos + dcid_len).ok_or_else(too_short)?.to_vec();
    pos += dcid_len;

    let scid_len = usize::from(*datagram.get(pos).ok_or_else(too_short)?);
    if scid_len > 20 {
        return Err(Error::packet_parse_at("SCID longer than 20 bytes", pos));
    }
    pos += 1;
    let scid = datagram.get(pos..pos + scid_len).ok_or_else(too_short)?.to_vec();
    pos += scid_len;

    let (token_len, n) = read_varint(datagram.get(pos..).ok_or_else(too_short)?).ok_or_else(too_short)?;
    pos += n;
    let token_len = usize::try_from(token_len).map_err(|_| too_short())?;
    pos = pos.checked_add(token_len).ok_or_else(too_short)?;

    let (length, n) = read_varint(datagram.get(pos..).ok_or_else(too_short)?).ok_or_else(too_short)?;
    pos += n;
    let length = usize::try_from(length).map_err(|_| too_short())?;
    if pos + length > datagram.len() {
        return Err(too_short());
    }

    Ok(InitialHeader {
        version,
        dcid,
        scid,
        pn_offset: pos,
        length,
    })
}

/// One CRYPTO frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    /// Offset in the crypto stream
    pub offset: u64,
    /// Frame data
    pub data: Vec<u8>,
}

/// Collect CRYPTO frames from a plaintext frame sequence. PADDING and PING
/// are skipped; parsing stops at the first frame of any other type.
pub fn crypto_frames(plain: &[u8]) -> Vec<CryptoFrame> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < plain.len() {
        let Some((frame_type, n)) = read_varint(&plain[pos..]) else {
            break;
        };
        pos += n;
        match frame_type {
            FRAME_PADDING | FRAME_PING => {}
            FRAME_CRYPTO => {
                let Some((offset, n)) = read_varint(&plain[pos..]) else {
                    break;
                };
                pos += n;
                let Some((len, n)) = read_varint(&plain[pos..]) else {
                    break;
                };
                pos += n;
                let Ok(len) = usize::try_from(len) else {
                    break;
                };
                let Some(data) = plain.get(pos..pos.saturating_add(len)) else {
                    break;
                };
                frames.push(CryptoFrame {
                    offset,
                    data: data.to_vec(),
                });
                pos += len;
            }
            _ => break,
        }
    }
    frames
}

/// Result of feeding one UDP payload to the QUIC extractor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicExtraction {
    /// Not a client Initial we can read
    NotInitial,
    /// CRYPTO data buffered, ClientHello not complete yet
    Pending,
    /// A complete ClientHello was reassembled and parsed
    Parsed(tls::ClientHelloLayout),
}

impl QuicExtraction {
    /// Validated hostname, if any
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Self::Parsed(layout) => layout.hostname.as_deref(),
            _ => None,
        }
    }
}

/// Frames of an Initial sent without protection: the packet number is
/// followed directly by frames
fn plaintext_frames<'a>(datagram: &'a [u8], header: &InitialHeader) -> &'a [u8] {
    let pn_len = usize::from(datagram[0] & 0x03) + 1;
    let start = (header.pn_offset + pn_len).min(datagram.len());
    let end = (header.pn_offset + header.length).min(datagram.len());
    &datagram[start..end.max(start)]
}

/// Stateless-per-datagram QUIC SNI extractor with a per-DCID reassembly
/// buffer. Owned by a single worker.
#[derive(Debug)]
pub struct QuicExtractor {
    reassembler: CryptoReassembler,
    decrypt: bool,
}

impl QuicExtractor {
    /// Create an extractor. With `decrypt` off, Initial payloads are read
    /// as plaintext frames.
    pub fn new(limits: ReassemblyLimits, decrypt: bool) -> Self {
        Self {
            reassembler: CryptoReassembler::new(limits),
            decrypt,
        }
    }

    /// Feed one UDP payload
    pub fn feed(&mut self, datagram: &[u8]) -> QuicExtraction {
        self.feed_at(datagram, Instant::now())
    }

    /// Feed one UDP payload with an explicit clock
    pub fn feed_at(&mut self, datagram: &[u8], now: Instant) -> QuicExtraction {
        let Ok(header) = parse_initial(datagram) else {
            return QuicExtraction::NotInitial;
        };

        let frames = if self.decrypt {
            match open_initial(datagram, &header) {
                Ok(plain) => crypto_frames(&plain),
                Err(e) => {
                    trace!(error = %e, "Initial did not decrypt, reading as plaintext");
                    crypto_frames(plaintext_frames(datagram, &header))
                }
            }
        } else {
            crypto_frames(plaintext_frames(datagram, &header))
        };

        if frames.is_empty() {
            return QuicExtraction::NotInitial;
        }

        // Frames after the one completing the ClientHello are not buffered
        let mut snapshot = None;
        for frame in frames {
            match self.reassembler.insert_at(&header.dcid, frame.offset, &frame.data, now) {
                Ok(Some(prefix)) => {
                    snapshot = Some(prefix);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    trace!(error = %e, "dropping QUIC reassembly state");
                    return QuicExtraction::NotInitial;
                }
            }
        }

        match snapshot {
            Some(prefix) => match tls::parse_handshake(&prefix) {
                Extraction::Parsed(layout) => QuicExtraction::Parsed(layout),
                _ => QuicExtraction::NotInitial,
            },
            None => QuicExtraction::Pending,
        }
    }

    /// Evict idle reassembly buffers
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        self.reassembler.sweep_at(now)
    }

    /// Number of connections with buffered CRYPTO data
    pub fn pending(&self) -> usize {
        self.reassembler.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ClientHelloBuilder;

    fn crypto_frame(offset: u64, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x06];
        frame.extend_from_slice(&(0x8000_0000u32 | u32::try_from(offset).unwrap()).to_be_bytes());
        frame.extend_from_slice(&(0x4000u16 | u16::try_from(data.len()).unwrap()).to_be_bytes());
        frame.extend_from_slice(data);
        frame
    }

    #[test]
    fn test_varint() {
        assert_eq!(read_varint(&[0x25]), Some((37, 1)));
        assert_eq!(read_varint(&[0x7b, 0xbd]), Some((15293, 2)));
        assert_eq!(read_varint(&[0x9d, 0x7f, 0x3e, 0x7d]), Some((494_878_333, 4)));
        assert_eq!(read_varint(&[0x7b]), None);
    }

    #[test]
    fn test_crypto_frames_skip_padding_and_ping() {
        let mut plain = vec![0x00, 0x01, 0x00];
        plain.extend(crypto_frame(0, b"abc"));
        plain.extend([0x00, 0x00]);
        plain.extend(crypto_frame(3, b"de"));
        let frames = crypto_frames(&plain);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].offset, 3);
        assert_eq!(frames[1].data, b"de");
    }

    #[test]
    fn test_crypto_frames_stop_on_unknown() {
        let mut plain = crypto_frame(0, b"abc");
        plain.push(0x02); // ACK
        plain.extend(crypto_frame(3, b"de"));
        assert_eq!(crypto_frames(&plain).len(), 1);
    }

    #[test]
    fn test_parse_initial_rejects_short_header() {
        assert!(parse_initial(&[0x40, 0, 0, 0, 1]).is_err());
        assert!(parse_initial(&[0xc0, 0, 0, 0, 1, 8, 1, 2]).is_err());
    }

    #[test]
    fn test_encrypted_initial_split_across_datagrams() {
        let hs = ClientHelloBuilder::new("video.example.net").build_handshake();
        let dcid = [0xAB; 8];
        let first = crypto::tests::seal_initial(&dcid, 0, &crypto_frame(0, &hs[..150]));
        let second = crypto::tests::seal_initial(&dcid, 1, &crypto_frame(150, &hs[150..]));

        let mut extractor = QuicExtractor::new(ReassemblyLimits::default(), true);
        assert_eq!(extractor.feed(&second), QuicExtraction::Pending);
        let result = extractor.feed(&first);
        assert_eq!(result.hostname(), Some("video.example.net"));
        assert_eq!(extractor.pending(), 0);
    }

    #[test]
    fn test_frames_after_complete_hello_not_buffered() {
        let hs = ClientHelloBuilder::new("video.example.net").build_handshake();
        let dcid = [0xCD; 8];
        let mut frames = crypto_frame(0, &hs);
        frames.extend(crypto_frame(hs.len() as u64, b"trailing"));
        let datagram = crypto::tests::seal_initial(&dcid, 0, &frames);

        let mut extractor = QuicExtractor::new(ReassemblyLimits::default(), true);
        let result = extractor.feed(&datagram);
        assert_eq!(result.hostname(), Some("video.example.net"));
        assert_eq!(extractor.pending(), 0);
    }
}
