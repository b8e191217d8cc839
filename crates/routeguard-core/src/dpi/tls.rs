//! TLS ClientHello parsing
//!
//! Layout of the first flight:
//!
//! ```text
//! record header   type(1)=0x16 version(2) length(2)
//! handshake       type(1)=0x01 length(3)
//! client hello    version(2) random(32) session_id(1+N)
//!                 cipher_suites(2+N) compression(1+N) extensions(2+N)
//! extension       type(2) length(2) data(N)
//! server_name     list_len(2) name_type(1)=0 name_len(2) host(N)
//! ```
//!
//! Only a ClientHello contained in a single record is recognized.

use rand::RngCore;

/// TLS content type for handshake records
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello
pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// server_name extension
pub const EXT_SERVER_NAME: u16 = 0x0000;
/// padding extension (RFC 7685)
pub const EXT_PADDING: u16 = 0x0015;
/// Record header size
pub const RECORD_HEADER_LEN: usize = 5;
/// Handshake header size
pub const HANDSHAKE_HEADER_LEN: usize = 4;
/// Largest plaintext record payload
pub const MAX_RECORD_PAYLOAD: usize = 1 << 14;

/// Location of the SNI hostname inside the inspected buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerName {
    /// Lowercased hostname
    pub host: String,
    /// Offset of the first hostname byte
    pub offset: usize,
    /// Hostname length in bytes
    pub len: usize,
}

/// Offsets of a parsed ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// End of the record holding the ClientHello
    pub record_end: usize,
    /// Offset of the 2-byte extensions length, if extensions are present
    pub extensions_len_offset: Option<usize>,
    /// End of the extensions block (equals the handshake end)
    pub extensions_end: usize,
    /// The SNI, when present and well-formed
    pub server_name: Option<ServerName>,
}

/// Outcome of parsing the bytes seen so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parse {
    /// Could still become a ClientHello; need more bytes
    Incomplete,
    /// Not a TLS handshake
    NotHandshake,
    /// Looked like a ClientHello but the lengths do not add up
    Malformed(&'static str),
    /// A complete ClientHello
    Hello(ClientHello),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize, end: usize) -> Self {
        Self { buf, pos, end }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.end {
            return None;
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip_u8_prefixed(&mut self) -> Option<()> {
        let n = self.u8()?;
        self.take(usize::from(n)).map(|_| ())
    }

    fn skip_u16_prefixed(&mut self) -> Option<()> {
        let n = self.u16()?;
        self.take(usize::from(n)).map(|_| ())
    }
}

/// Read a 24-bit big-endian length
pub fn read_u24(b: &[u8]) -> usize {
    (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])
}

/// Write a 24-bit big-endian length
pub fn write_u24(b: &mut [u8], v: usize) {
    b[0] = ((v >> 16) & 0xff) as u8;
    b[1] = ((v >> 8) & 0xff) as u8;
    b[2] = (v & 0xff) as u8;
}

/// Parse the start of a client byte stream
pub fn parse_client_hello(buf: &[u8]) -> Parse {
    if buf.is_empty() {
        return Parse::Incomplete;
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Parse::NotHandshake;
    }
    if buf.len() >= 2 && buf[1] != 0x03 {
        return Parse::NotHandshake;
    }
    if buf.len() > RECORD_HEADER_LEN && buf[RECORD_HEADER_LEN] != HANDSHAKE_CLIENT_HELLO {
        return Parse::NotHandshake;
    }
    if buf.len() < RECORD_HEADER_LEN {
        return Parse::Incomplete;
    }

    let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if record_len < HANDSHAKE_HEADER_LEN || record_len > MAX_RECORD_PAYLOAD {
        return Parse::Malformed("record length out of range");
    }
    let record_end = RECORD_HEADER_LEN + record_len;
    if buf.len() < record_end {
        return Parse::Incomplete;
    }

    let hs_len = read_u24(&buf[RECORD_HEADER_LEN + 1..RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN]);
    let body_start = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN;
    if body_start + hs_len > record_end {
        return Parse::Malformed("handshake spans multiple records");
    }
    let body_end = body_start + hs_len;

    match parse_body(buf, body_start, body_end) {
        Some((extensions_len_offset, server_name)) => Parse::Hello(ClientHello {
            record_end,
            extensions_len_offset,
            extensions_end: body_end,
            server_name,
        }),
        None => Parse::Malformed("truncated ClientHello body"),
    }
}

#[allow(clippy::type_complexity)]
fn parse_body(buf: &[u8], start: usize, end: usize) -> Option<(Option<usize>, Option<ServerName>)> {
    let mut r = Reader::new(buf, start, end);
    r.take(2)?; // legacy_version
    r.take(32)?; // random
    r.skip_u8_prefixed()?; // session_id
    r.skip_u16_prefixed()?; // cipher_suites
    r.skip_u8_prefixed()?; // compression_methods

    if r.pos == end {
        return Some((None, None));
    }

    let ext_len_offset = r.pos;
    let ext_len = usize::from(r.u16()?);
    if r.pos + ext_len != end {
        return None;
    }

    let mut server_name = None;
    while r.pos < end {
        let ext_type = r.u16()?;
        let len = usize::from(r.u16()?);
        let data_offset = r.pos;
        let data = r.take(len)?;
        if ext_type == EXT_SERVER_NAME && server_name.is_none() {
            server_name = parse_server_name(data, data_offset);
        }
    }

    Some((Some(ext_len_offset), server_name))
}

fn parse_server_name(data: &[u8], base: usize) -> Option<ServerName> {
    let mut r = Reader::new(data, 0, data.len());
    let list_len = usize::from(r.u16()?);
    let list_end = (2 + list_len).min(data.len());
    r.end = list_end;

    while r.pos < list_end {
        let name_type = r.u8()?;
        let len = usize::from(r.u16()?);
        let offset = base + r.pos;
        let name = r.take(len)?;
        if name_type != 0 {
            continue;
        }
        if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        let host = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
        return Some(ServerName { host, offset, len });
    }
    None
}

/// Build a minimal TLS 1.3-style ClientHello carrying `sni`
///
/// Used for diagnostics, where no real client handshake is at hand.
pub fn build_client_hello(sni: &str) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let host = sni.as_bytes();

    let mut body = Vec::with_capacity(128 + host.len());
    body.extend_from_slice(&[0x03, 0x03]);
    let mut random = [0u8; 32];
    rng.fill_bytes(&mut random);
    body.extend_from_slice(&random);
    let mut session = [0u8; 32];
    rng.fill_bytes(&mut session);
    body.push(32);
    body.extend_from_slice(&session);
    // TLS_AES_128_GCM_SHA256, TLS_AES_256_GCM_SHA384, TLS_CHACHA20_POLY1305_SHA256,
    // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
    body.extend_from_slice(&[0x00, 0x08, 0x13, 0x01, 0x13, 0x02, 0x13, 0x03, 0xc0, 0x2f]);
    body.extend_from_slice(&[0x01, 0x00]);

    let mut exts = Vec::new();
    #[allow(clippy::cast_possible_truncation)]
    {
        let name_len = host.len() as u16;
        exts.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        exts.extend_from_slice(&(name_len + 5).to_be_bytes());
        exts.extend_from_slice(&(name_len + 3).to_be_bytes());
        exts.push(0x00);
        exts.extend_from_slice(&name_len.to_be_bytes());
        exts.extend_from_slice(host);
    }
    // supported_versions: TLS 1.3
    exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

    #[allow(clippy::cast_possible_truncation)]
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + body.len());
    out.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&((body.len() + HANDSHAKE_HEADER_LEN) as u16).to_be_bytes());
    out.push(HANDSHAKE_CLIENT_HELLO);
    let mut len = [0u8; 3];
    write_u24(&mut len, body.len());
    out.extend_from_slice(&len);
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_built_hello() {
        let hello = build_client_hello("Blocked.Test");
        let Parse::Hello(parsed) = parse_client_hello(&hello) else {
            panic!("expected a ClientHello");
        };
        assert_eq!(parsed.record_end, hello.len());
        assert_eq!(parsed.extensions_end, hello.len());

        let sni = parsed.server_name.unwrap();
        assert_eq!(sni.host, "blocked.test");
        assert_eq!(&hello[sni.offset..sni.offset + sni.len], b"Blocked.Test");
    }

    #[test]
    fn test_every_prefix_is_incomplete() {
        let hello = build_client_hello("example.com");
        for n in 0..hello.len() {
            assert_eq!(parse_client_hello(&hello[..n]), Parse::Incomplete, "prefix {n}");
        }
    }

    #[test]
    fn test_not_handshake() {
        assert_eq!(parse_client_hello(b"GET / HTTP/1.1\r\n"), Parse::NotHandshake);
        assert_eq!(parse_client_hello(&[0x16, 0x02]), Parse::NotHandshake);
        // ServerHello, not ClientHello
        assert_eq!(
            parse_client_hello(&[0x16, 0x03, 0x03, 0x00, 0x10, 0x02]),
            Parse::NotHandshake
        );
    }

    #[test]
    fn test_inconsistent_lengths_are_malformed() {
        let mut hello = build_client_hello("example.com");
        // inflate the handshake length beyond the record
        hello[8] = hello[8].wrapping_add(50);
        assert!(matches!(parse_client_hello(&hello), Parse::Malformed(_)));

        let mut hello = build_client_hello("example.com");
        hello[3] = 0;
        hello[4] = 2;
        assert!(matches!(parse_client_hello(&hello), Parse::Malformed(_)));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut data = build_client_hello("example.com");
        let record_end = data.len();
        data.extend_from_slice(b"early data");
        let Parse::Hello(parsed) = parse_client_hello(&data) else {
            panic!("expected a ClientHello");
        };
        assert_eq!(parsed.record_end, record_end);
    }

    #[test]
    fn test_u24() {
        let mut b = [0u8; 3];
        write_u24(&mut b, 0x01_02_03);
        assert_eq!(b, [1, 2, 3]);
        assert_eq!(read_u24(&b), 0x01_02_03);
    }
}
