//! ClientHello sniffing
//!
//! Incremental parser over peeked bytes: decides whether the connection
//! opens with a TLS ClientHello and, if so, pulls the `server_name`
//! extension out of it. The parser never consumes from the socket; the
//! adapter owns buffering and replays everything through
//! [`crate::tls::Rewind`].

use thiserror::Error;

/// TLS handshake record content type.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// Extension id for server_name.
const EXT_SERVER_NAME: u16 = 0x0000;
/// server_name entry type host_name.
const SNI_HOST_NAME: u8 = 0x00;

#[derive(Debug, Error)]
pub enum PeekError {
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
}

/// Outcome of sniffing the currently buffered prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// The prefix is consistent with TLS but incomplete; peek more bytes.
    NeedMoreData,
    /// The prefix cannot be a TLS ClientHello; treat as plain HTTP.
    NotTls,
    /// A complete ClientHello with the advertised SNI, if any.
    ClientHello { server_name: Option<String> },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], PeekError> {
        if self.pos + n > self.buf.len() {
            return Err(PeekError::Malformed(what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, PeekError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, PeekError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Sniff the buffered prefix of a connection.
///
/// Returns [`Sniff::NeedMoreData`] until a full handshake record is
/// buffered. A record that is present but does not decode as a
/// ClientHello is an error; non-TLS prefixes are [`Sniff::NotTls`].
pub fn parse_client_hello(buf: &[u8]) -> Result<Sniff, PeekError> {
    if buf.is_empty() {
        return Ok(Sniff::NeedMoreData);
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok(Sniff::NotTls);
    }
    if buf.len() >= 2 && buf[1] != 0x03 {
        // Record-layer major version is 3 for SSL3 through TLS 1.3.
        return Ok(Sniff::NotTls);
    }
    if buf.len() < 5 {
        return Ok(Sniff::NeedMoreData);
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return Ok(Sniff::NeedMoreData);
    }

    let handshake = &buf[5..5 + record_len];
    if handshake.len() < 4 {
        return Err(PeekError::Malformed("handshake header"));
    }
    if handshake[0] != HANDSHAKE_CLIENT_HELLO {
        // Some other handshake message first; not an interceptable hello.
        return Ok(Sniff::NotTls);
    }

    let hello_len =
        ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | handshake[3] as usize;
    if hello_len > handshake.len() - 4 {
        // Hello continues in a following record; the peek window cannot
        // hold it.
        return Err(PeekError::Malformed("hello spans records"));
    }

    let mut cur = Cursor::new(&handshake[4..4 + hello_len]);
    cur.take(2, "client version")?;
    cur.take(32, "random")?;
    let session_len = cur.u8("session id length")? as usize;
    cur.take(session_len, "session id")?;
    let ciphers_len = cur.u16("cipher suites length")? as usize;
    cur.take(ciphers_len, "cipher suites")?;
    let compression_len = cur.u8("compression length")? as usize;
    cur.take(compression_len, "compression methods")?;

    if cur.remaining() == 0 {
        // Legal hello with no extensions block at all.
        return Ok(Sniff::ClientHello { server_name: None });
    }

    let extensions_len = cur.u16("extensions length")? as usize;
    let mut ext = Cursor::new(cur.take(extensions_len, "extensions")?);

    while ext.remaining() >= 4 {
        let ext_type = ext.u16("extension type")?;
        let ext_len = ext.u16("extension length")? as usize;
        let data = ext.take(ext_len, "extension data")?;

        if ext_type == EXT_SERVER_NAME {
            return Ok(Sniff::ClientHello {
                server_name: parse_server_name(data)?,
            });
        }
    }

    Ok(Sniff::ClientHello { server_name: None })
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, PeekError> {
    let mut cur = Cursor::new(data);
    let list_len = cur.u16("server name list length")? as usize;
    let mut list = Cursor::new(cur.take(list_len, "server name list")?);

    while list.remaining() >= 3 {
        let name_type = list.u8("server name type")?;
        let name_len = list.u16("server name length")? as usize;
        let name = list.take(name_len, "server name")?;

        if name_type == SNI_HOST_NAME {
            if name.is_empty() {
                return Ok(None);
            }
            let host = std::str::from_utf8(name)
                .map_err(|_| PeekError::Malformed("server name encoding"))?;
            return Ok(Some(host.to_string()));
        }
    }

    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a syntactically valid ClientHello record, optionally with an
    /// SNI extension.
    pub(crate) fn build_client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(host) = server_name {
            let name = host.as_bytes();
            let mut sni = Vec::new();
            sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list length
            sni.push(SNI_HOST_NAME);
            sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
            sni.extend_from_slice(name);

            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&sni);
        }
        // A throwaway extension so the extensions block is never empty.
        extensions.extend_from_slice(&0x000bu16.to_be_bytes()); // ec_point_formats
        extensions.extend_from_slice(&2u16.to_be_bytes());
        extensions.extend_from_slice(&[0x01, 0x00]);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // TLS 1.2 client version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // empty session id
        hello.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1); // one compression method
        hello.push(0x00);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        let len = hello.len();
        handshake.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        handshake.extend_from_slice(&hello);

        let mut record = Vec::new();
        record.push(CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extracts_sni() {
        let bytes = build_client_hello(Some("example.test"));
        let sniff = parse_client_hello(&bytes).unwrap();
        assert_eq!(
            sniff,
            Sniff::ClientHello {
                server_name: Some("example.test".to_string())
            }
        );
    }

    #[test]
    fn test_hello_without_sni() {
        let bytes = build_client_hello(None);
        let sniff = parse_client_hello(&bytes).unwrap();
        assert_eq!(sniff, Sniff::ClientHello { server_name: None });
    }

    #[test]
    fn test_plain_http_is_not_tls() {
        let sniff = parse_client_hello(b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
        assert_eq!(sniff, Sniff::NotTls);
    }

    #[test]
    fn test_partial_record_needs_more() {
        let bytes = build_client_hello(Some("example.test"));
        for cut in [0, 1, 4, 10, bytes.len() - 1] {
            let sniff = parse_client_hello(&bytes[..cut]).unwrap();
            assert_eq!(sniff, Sniff::NeedMoreData, "cut at {cut}");
        }
    }

    #[test]
    fn test_wrong_record_version_is_not_tls() {
        let mut bytes = build_client_hello(Some("example.test"));
        bytes[1] = 0x02;
        assert_eq!(parse_client_hello(&bytes).unwrap(), Sniff::NotTls);
    }

    #[test]
    fn test_non_hello_handshake_is_not_tls() {
        let mut bytes = build_client_hello(None);
        bytes[5] = 0x02; // ServerHello
        assert_eq!(parse_client_hello(&bytes).unwrap(), Sniff::NotTls);
    }

    #[test]
    fn test_truncated_hello_body_is_malformed() {
        let mut bytes = build_client_hello(Some("example.test"));
        // Claim a longer hello than the record carries.
        bytes[6] = 0x10;
        assert!(parse_client_hello(&bytes).is_err());
    }
}
