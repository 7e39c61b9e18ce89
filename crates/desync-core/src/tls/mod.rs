//! TLS ClientHello parsing
//!
//! Walks a ClientHello with explicit bounds checks at every length field and
//! reports where each piece lives in the buffer. Strategies use the
//! [`ClientHelloLayout`] to pick split points; the flow tracker only needs the
//! hostname.

mod hello;

pub use hello::ClientHelloBuilder;
pub(crate) use hello::{alpn_body, server_name_body};

use crate::packet::MAX_HOSTNAME_LEN;

/// TLS record content type for handshake messages
pub const CONTENT_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Length of a TLS record header
pub const RECORD_HEADER_LEN: usize = 5;
/// `server_name` extension type
pub const EXT_SERVER_NAME: u16 = 0x0000;
/// `padding` extension type
pub const EXT_PADDING: u16 = 0x0015;
/// `application_layer_protocol_negotiation` extension type
pub const EXT_ALPN: u16 = 0x0010;
/// `pre_shared_key` extension type (must stay last)
pub const EXT_PRE_SHARED_KEY: u16 = 0x0029;

/// Outcome of looking for a ClientHello in a byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// More bytes are required before anything can be decided
    Incomplete,
    /// The bytes are not a (well-formed) ClientHello
    NotClientHello,
    /// A complete ClientHello was parsed
    Parsed(ClientHelloLayout),
}

impl Extraction {
    /// Validated hostname, if a ClientHello with a usable SNI was parsed
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Self::Parsed(layout) => layout.hostname.as_deref(),
            _ => None,
        }
    }
}

/// One extension inside the ClientHello extension list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionSpan {
    /// Extension type
    pub ext_type: u16,
    /// Offset of the extension type field
    pub start: usize,
    /// Total length including the 4-byte extension header
    pub len: usize,
}

impl ExtensionSpan {
    /// Offset one past the last byte of this extension
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Where the SNI hostname bytes are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniSpan {
    /// Offset of the `server_name` extension type field
    pub ext_start: usize,
    /// Offset of the first hostname byte
    pub host_start: usize,
    /// Hostname length
    pub host_len: usize,
}

impl SniSpan {
    /// Offset of the middle byte of the hostname
    pub fn midpoint(&self) -> usize {
        self.host_start + self.host_len / 2
    }

    /// Offset one past the last hostname byte
    pub fn host_end(&self) -> usize {
        self.host_start + self.host_len
    }
}

/// Offsets of the structural pieces of a parsed ClientHello.
///
/// All offsets are relative to the start of the buffer that was parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloLayout {
    /// Whether a 5-byte TLS record header precedes the handshake
    pub has_record: bool,
    /// Offset of the handshake type byte
    pub handshake_start: usize,
    /// Offset one past the end of the ClientHello (record end for TLS)
    pub end: usize,
    /// Offset of the 2-byte extension list length
    pub extensions_len_at: usize,
    /// Extensions in wire order
    pub extensions: Vec<ExtensionSpan>,
    /// SNI position, if a well-formed host_name entry exists
    pub sni: Option<SniSpan>,
    /// Validated hostname
    pub hostname: Option<String>,
}

impl ClientHelloLayout {
    /// Offset of the first extension (or of the list end when empty)
    pub fn extensions_start(&self) -> usize {
        self.extensions_len_at + 2
    }

    /// The `server_name` extension span
    pub fn server_name_extension(&self) -> Option<&ExtensionSpan> {
        self.extensions.iter().find(|e| e.ext_type == EXT_SERVER_NAME)
    }

    /// Whether an extension of this type is present
    pub fn has_extension(&self, ext_type: u16) -> bool {
        self.extensions.iter().any(|e| e.ext_type == ext_type)
    }

    /// Whether the whole ClientHello, starting with its record header, is
    /// addressed by this layout
    pub fn is_whole(&self) -> bool {
        self.has_record && self.handshake_start == RECORD_HEADER_LEN
    }

    /// Re-express offsets relative to a segment that begins `prefix` bytes
    /// into the parsed buffer. Pieces that lie before the segment are
    /// dropped. Returns `None` when the SNI is not inside the segment.
    pub fn rebase(&self, prefix: usize) -> Option<Self> {
        if prefix == 0 {
            return Some(self.clone());
        }
        let sni = self.sni?;
        if sni.host_start < prefix || sni.ext_start < prefix {
            return None;
        }
        Some(Self {
            has_record: false,
            handshake_start: self.handshake_start.saturating_sub(prefix),
            end: self.end - prefix,
            extensions_len_at: self.extensions_len_at.saturating_sub(prefix),
            extensions: self
                .extensions
                .iter()
                .filter(|e| e.start >= prefix)
                .map(|e| ExtensionSpan {
                    start: e.start - prefix,
                    ..*e
                })
                .collect(),
            sni: Some(SniSpan {
                ext_start: sni.ext_start - prefix,
                host_start: sni.host_start - prefix,
                host_len: sni.host_len,
            }),
            hostname: self.hostname.clone(),
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize, end: usize) -> Self {
        Self { buf, pos, end }
    }

    fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Option<u8> {
        if self.remaining() < 1 {
            return None;
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Some(v)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }
}

fn u24(b: &[u8]) -> usize {
    (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])
}

/// Validate a hostname taken from the wire: `[a-zA-Z0-9._-]` only, and it
/// must contain a dot unless it is `localhost`. Anything else is rejected.
pub fn validate_hostname(raw: &[u8]) -> Option<String> {
    if raw.is_empty() || raw.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !raw
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
    {
        return None;
    }
    let host = std::str::from_utf8(raw).ok()?;
    if host.contains('.') || host.eq_ignore_ascii_case("localhost") {
        Some(host.to_string())
    } else {
        None
    }
}

/// Parse a TLS record expected to hold a ClientHello
pub fn parse_record(buf: &[u8]) -> Extraction {
    if buf.len() < RECORD_HEADER_LEN {
        return Extraction::Incomplete;
    }
    if buf[0] != CONTENT_HANDSHAKE || buf[1] != 0x03 {
        return Extraction::NotClientHello;
    }
    let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if buf.len() < RECORD_HEADER_LEN + record_len {
        return Extraction::Incomplete;
    }
    match walk(buf, RECORD_HEADER_LEN, RECORD_HEADER_LEN + record_len) {
        Some(mut layout) => {
            layout.has_record = true;
            Extraction::Parsed(layout)
        }
        None => Extraction::NotClientHello,
    }
}

/// Parse a bare handshake message (QUIC CRYPTO stream contents)
pub fn parse_handshake(buf: &[u8]) -> Extraction {
    if buf.len() < 4 {
        return Extraction::Incomplete;
    }
    if buf[0] != HANDSHAKE_CLIENT_HELLO {
        return Extraction::NotClientHello;
    }
    let total = 4 + u24(&buf[1..4]);
    if buf.len() < total {
        return Extraction::Incomplete;
    }
    walk(buf, 0, total).map_or(Extraction::NotClientHello, Extraction::Parsed)
}

/// Whether `buf` starts with a complete ClientHello handshake message
pub fn handshake_complete(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[0] == HANDSHAKE_CLIENT_HELLO && buf.len() >= 4 + u24(&buf[1..4])
}

/// Walk the handshake message in `buf[start..end]`
fn walk(buf: &[u8], start: usize, end: usize) -> Option<ClientHelloLayout> {
    let mut c = Cursor::new(buf, start, end);
    if c.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    if c.remaining() < 3 {
        return None;
    }
    let hs_len = u24(&buf[c.pos..c.pos + 3]);
    c.skip(3)?;
    if c.remaining() < hs_len {
        return None;
    }
    let hs_end = c.pos + hs_len;
    let mut c = Cursor::new(buf, c.pos, hs_end);

    c.skip(2 + 32)?; // legacy_version, random
    let sid_len = usize::from(c.u8()?);
    if sid_len > 32 {
        return None;
    }
    c.skip(sid_len)?;
    let cs_len = usize::from(c.u16()?);
    if cs_len == 0 || cs_len % 2 != 0 {
        return None;
    }
    c.skip(cs_len)?;
    let comp_len = usize::from(c.u8()?);
    if comp_len == 0 {
        return None;
    }
    c.skip(comp_len)?;

    let mut layout = ClientHelloLayout {
        has_record: false,
        handshake_start: start,
        end: hs_end,
        extensions_len_at: c.pos,
        extensions: Vec::new(),
        sni: None,
        hostname: None,
    };

    if c.remaining() == 0 {
        layout.extensions_len_at = hs_end.saturating_sub(2);
        return Some(layout);
    }

    let ext_total = usize::from(c.u16()?);
    if c.remaining() < ext_total {
        return None;
    }
    let mut c = Cursor::new(buf, c.pos, c.pos + ext_total);
    while c.remaining() > 0 {
        let ext_start = c.pos;
        let ext_type = c.u16()?;
        let ext_len = usize::from(c.u16()?);
        let data_start = c.pos;
        c.skip(ext_len)?;
        layout.extensions.push(ExtensionSpan {
            ext_type,
            start: ext_start,
            len: 4 + ext_len,
        });
        if ext_type == EXT_SERVER_NAME && layout.sni.is_none() {
            if let Some(span) = parse_server_name(buf, ext_start, data_start, data_start + ext_len) {
                layout.hostname = validate_hostname(&buf[span.host_start..span.host_end()]);
                layout.sni = Some(span);
            }
        }
    }

    Some(layout)
}

fn parse_server_name(buf: &[u8], ext_start: usize, start: usize, end: usize) -> Option<SniSpan> {
    let mut c = Cursor::new(buf, start, end);
    let list_len = usize::from(c.u16()?);
    if c.remaining() < list_len {
        return None;
    }
    let mut c = Cursor::new(buf, c.pos, c.pos + list_len);
    while c.remaining() > 0 {
        let name_type = c.u8()?;
        let name_len = usize::from(c.u16()?);
        let host_start = c.pos;
        c.skip(name_len)?;
        if name_type == 0 {
            return Some(SniSpan {
                ext_start,
                host_start,
                host_len: name_len,
            });
        }
    }
    None
}
