//! ## HTTP/1.1 head codec
//!
//! Pure functions over request and response heads, shared by the proxy data
//! plane. The codec never touches a socket: it receives the bytes that
//! precede the `\r\n\r\n` terminator and hands back the start line plus an
//! order-preserving header map, or rebuilds the wire form after the proxy
//! has rewritten headers.
//!
//! Header keys keep their original casing. A duplicate key overwrites the
//! previous value, the insertion position of the first occurrence is kept.

use std::io::Write;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compression, write::GzEncoder};

/// The bytes that terminate a request or response head on the wire.
pub const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The start line does not have the shape the caller required.
    InvalidStartLine,
    /// A header line does not split on `": "` into a key and a value, or the
    /// head is not valid UTF-8.
    InvalidHeader,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An insertion-ordered header map with single-value, last-wins semantics.
///
/// Reconstruction walks the entries in insertion order, so the wire output
/// of parse + reconstruct is deterministic.
///
/// # Test
///
/// ```
/// use relay_server_codec::HeaderMap;
///
/// let mut headers = HeaderMap::default();
///
/// headers.insert("Host", "api.example.com");
/// headers.insert("Content-Length", "9");
/// headers.insert("Host", "internal");
///
/// assert_eq!(headers.get("Host"), Some("internal"));
/// assert_eq!(headers.get_ignore_case("host"), Some("internal"));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderMap(Vec<(String, String)>);

impl HeaderMap {
    /// Insert with exact-key overwrite. A key that was never seen before is
    /// appended at the end, matching dict-style insertion order.
    pub fn insert(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    /// Update a header whatever its casing, keeping its position and original
    /// spelling. Appends when the header is not present yet.
    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .0
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Case-insensitive lookup, first match wins.
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_ignore_case(&self, key: &str) -> bool {
        self.get_ignore_case(key).is_some()
    }

    /// Remove every entry whose key matches under any casing. `Connection`
    /// is hop-by-hop, the proxy strips it no matter how the client spelled
    /// it.
    pub fn remove_ignore_case(&mut self, key: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parse a request head into the request line and the header map.
///
/// The request line must carry exactly three whitespace-separated tokens
/// (method, path, version). Every following line must split on `": "` into a
/// key and a value.
///
/// # Test
///
/// ```
/// use relay_server_codec::parse_request;
///
/// let head = b"GET /index.html HTTP/1.1\r\nHost: api.example.com\r\nAccept-Encoding: gzip";
/// let (line, headers) = parse_request(head).unwrap();
///
/// assert_eq!(line, "GET /index.html HTTP/1.1");
/// assert_eq!(headers.get("Host"), Some("api.example.com"));
/// assert_eq!(headers.get("Accept-Encoding"), Some("gzip"));
/// ```
pub fn parse_request(head: &[u8]) -> Result<(String, HeaderMap), Error> {
    let (line, headers) = split_head(head)?;

    if line.split_whitespace().count() != 3 {
        return Err(Error::InvalidStartLine);
    }

    Ok((line, headers))
}

/// Parse a response head. Same splitter rules as [`parse_request`] except
/// that the status line is taken as-is, backends are free to put any reason
/// phrase in it.
pub fn parse_response(head: &[u8]) -> Result<(String, HeaderMap), Error> {
    split_head(head)
}

fn split_head(head: &[u8]) -> Result<(String, HeaderMap), Error> {
    let head = std::str::from_utf8(head).map_err(|_| Error::InvalidHeader)?;

    let mut lines = head.split("\r\n");
    let line = lines.next().unwrap_or_default().to_string();

    let mut headers = HeaderMap::default();
    for item in lines {
        let mut pieces = item.split(": ");
        match (pieces.next(), pieces.next(), pieces.next()) {
            (Some(key), Some(value), None) => headers.insert(key, value),
            _ => return Err(Error::InvalidHeader),
        }
    }

    Ok((line, headers))
}

/// Rebuild a request for the wire: start line, headers in insertion order,
/// blank line, raw body.
///
/// # Test
///
/// ```
/// use relay_server_codec::{parse_request, reconstruct_request};
///
/// let head = b"POST /api HTTP/1.1\r\nHost: h\r\nContent-Length: 5";
/// let (line, headers) = parse_request(head).unwrap();
///
/// assert_eq!(
///     &reconstruct_request(&line, &headers, b"hello")[..],
///     b"POST /api HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
/// );
/// ```
pub fn reconstruct_request(line: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    reconstruct(line, headers, body)
}

/// Rebuild a response for the wire. Symmetric to [`reconstruct_request`].
pub fn reconstruct_response(line: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    reconstruct(line, headers, body)
}

fn reconstruct(line: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(line.len() + body.len() + headers.len() * 32 + 4);

    buffer.put_slice(line.as_bytes());
    buffer.put_slice(b"\r\n");

    for (key, value) in headers.iter() {
        buffer.put_slice(key.as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }

    buffer.put_slice(b"\r\n");
    buffer.put_slice(body);
    buffer.freeze()
}

/// Gzip a body with the default compression level.
pub fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2 + 16), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// Extract the first `max-age=N` (or `max-age="N"`) directive.
///
/// The match is case-insensitive and requires a word boundary in front of
/// `max-age`, so `s-maxage=60` does not count. Returns 0 when the directive
/// is absent.
///
/// # Test
///
/// ```
/// use relay_server_codec::cache_control_max_age;
///
/// assert_eq!(cache_control_max_age("must-revalidate, max-age=604800"), 604800);
/// assert_eq!(cache_control_max_age("must-revalidate, MAX-AGE=\"60\""), 60);
/// assert_eq!(cache_control_max_age("no-store"), 0);
/// ```
pub fn cache_control_max_age(directives: &str) -> u64 {
    const TOKEN: &[u8] = b"max-age=";

    let bytes = directives.as_bytes();
    let mut offset = 0;

    while offset + TOKEN.len() <= bytes.len() {
        if !bytes[offset..offset + TOKEN.len()].eq_ignore_ascii_case(TOKEN) {
            offset += 1;
            continue;
        }

        // Word boundary: the previous character must not be part of an
        // identifier, otherwise this is the tail of another directive.
        if offset > 0 {
            let previous = bytes[offset - 1];
            if previous.is_ascii_alphanumeric() || previous == b'_' {
                offset += 1;
                continue;
            }
        }

        let mut digits = &bytes[offset + TOKEN.len()..];
        if digits.first() == Some(&b'"') {
            digits = &digits[1..];
        }

        let count = digits.iter().take_while(|it| it.is_ascii_digit()).count();
        if count == 0 {
            offset += 1;
            continue;
        }

        return digits[..count]
            .iter()
            .fold(0u64, |acc, it| {
                acc.saturating_mul(10).saturating_add((it - b'0') as u64)
            });
    }

    0
}
