//! Legacy WebSocket handshake (Hixie-75 and Hixie-76).
//!
//! This module is sans-I/O: it parses the upgrade request out of a byte
//! buffer, derives the Hixie-76 challenge digest, and serializes the
//! response. Reading and writing sockets is left to [`crate::negotiator`].

use md5::{Digest, Md5};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Number of raw challenge bytes following the Hixie-76 header block.
pub const KEY3_LEN: usize = 8;

/// Status line of a successful legacy handshake.
pub const STATUS_LINE: &str = "HTTP/1.1 101 Web Socket Protocol Handshake";

/// The sub-protocol a client must offer to receive a protocol header.
pub const BASE64_PROTOCOL: &str = "base64";

/// Request sent by Flash socket clients before anything else.
pub const FLASH_POLICY_REQUEST: &[u8] = b"<policy-file-request/>";

/// Permissive cross-domain policy written in answer to [`FLASH_POLICY_REQUEST`].
pub const FLASH_POLICY_RESPONSE: &[u8] = b"<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\" /></cross-domain-policy>\n";

/// Handshake draft spoken by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// No key headers, no digest, unprefixed response headers.
    Hixie75,
    /// Numeric keys plus 8 raw bytes, answered with an MD5 digest.
    Hixie76,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::Hixie75 => write!(f, "hixie-75"),
            ProtocolVersion::Hixie76 => write!(f, "hixie-76"),
        }
    }
}

/// Returns the offset just past the blank line ending the header block.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Whether `buf` is the Flash policy request or a prefix of it.
#[must_use]
pub fn is_flash_policy_prefix(buf: &[u8]) -> bool {
    !buf.is_empty() && FLASH_POLICY_REQUEST.starts_with(&buf[..buf.len().min(FLASH_POLICY_REQUEST.len())])
}

/// Parse HTTP header lines into a map keyed by lower-cased name.
///
/// Stops at the first empty line. A repeated header from `unique` is rejected.
///
/// # Errors
/// Returns `Error::MalformedRequest` for a line without a colon or a duplicated unique header.
fn parse_headers<'a, I>(lines: I, unique: &[&str]) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedRequest(format!("Invalid header line: {}", line)))?;
        let name_lower = name.trim().to_lowercase();

        if unique.contains(&name_lower.as_str()) && headers.contains_key(&name_lower) {
            return Err(Error::MalformedRequest(format!(
                "Duplicate header: {}",
                name.trim()
            )));
        }

        headers.insert(name_lower, value.trim().to_string());
    }

    Ok(headers)
}

/// Validate that an echoed value does not contain CR or LF characters.
fn validate_header_value(header_name: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::MalformedRequest(format!(
            "{} contains CR or LF characters",
            header_name
        )));
    }
    Ok(())
}

/// Derive the number encoded in a Hixie-76 key header.
///
/// All decimal digits are concatenated and the result divided by the number
/// of space characters.
///
/// # Example
///
/// ```
/// use wsrelay::protocol::handshake::key_number;
///
/// assert_eq!(key_number("4 @1  46546xW%0l 1 5", "key1").unwrap(), 829_309_203);
/// ```
///
/// # Errors
///
/// Returns [`Error::KeyDivision`] if the key has no spaces, or
/// [`Error::MalformedRequest`] if the digits overflow or the quotient does
/// not fit in 32 bits.
pub fn key_number(key: &str, name: &'static str) -> Result<u32> {
    let mut spaces: u64 = 0;
    let mut number: u64 = 0;

    for c in key.chars() {
        if c == ' ' {
            spaces += 1;
        } else if let Some(digit) = c.to_digit(10) {
            number = number
                .checked_mul(10)
                .and_then(|n| n.checked_add(u64::from(digit)))
                .ok_or_else(|| Error::MalformedRequest(format!("{} number overflows", name)))?;
        }
    }

    if spaces == 0 {
        return Err(Error::KeyDivision(name));
    }

    u32::try_from(number / spaces)
        .map_err(|_| Error::MalformedRequest(format!("{} quotient exceeds 32 bits", name)))
}

/// Computes the 16-byte Hixie-76 challenge response.
///
/// The digest is MD5 over `num1` and `num2` as big-endian 32-bit integers
/// followed by the 8 raw `key3` bytes.
///
/// # Example
///
/// ```
/// use wsrelay::protocol::handshake::compute_digest;
///
/// let digest = compute_digest(829_309_203, 259_970_620, b"^n:ds[4U");
/// assert_eq!(&digest, b"8jKS'y:G*Co,Wxa-");
/// ```
#[must_use]
pub fn compute_digest(num1: u32, num2: u32, key3: &[u8; KEY3_LEN]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(num1.to_be_bytes());
    hasher.update(num2.to_be_bytes());
    hasher.update(key3);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Parsed legacy upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// The request method (e.g., "GET").
    pub method: String,
    /// The request path (e.g., "/websockify").
    pub path: String,
    /// All headers, keyed by lower-cased name.
    pub headers: HashMap<String, String>,
    /// The Origin header value (optional).
    pub origin: Option<String>,
    /// The Host header value.
    pub host: String,
    /// The Sec-WebSocket-Key1 header value (Hixie-76 only).
    pub key1: Option<String>,
    /// The Sec-WebSocket-Key2 header value (Hixie-76 only).
    pub key2: Option<String>,
    /// The 8 raw bytes after the header block (Hixie-76 only).
    pub key3: Option<[u8; KEY3_LEN]>,
    /// Offered sub-protocols.
    pub protocols: Vec<String>,
}

impl HandshakeRequest {
    /// Parse the request line and header block.
    ///
    /// `head` must contain everything up to and including the blank line;
    /// `key3` is left unset.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedRequest`] if the data is not UTF-8, the request
    ///   line is not `METHOD /path HTTP/1.1`, a header line has no colon, a
    ///   unique header repeats, `Host` is missing, only one key header is
    ///   present, or the request is an RFC 6455 handshake.
    /// - [`Error::NotWebSocket`] if `Upgrade` is missing or not `websocket`.
    /// - [`Error::KeyDivision`] if a key header contains no spaces.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::MalformedRequest("Invalid UTF-8".into()))?;

        let mut lines = text.lines();

        // Parse request line: "GET /path HTTP/1.1"
        let request_line = lines
            .next()
            .ok_or_else(|| Error::MalformedRequest("Empty request".into()))?;

        let parts: Vec<&str> = request_line.split(' ').collect();
        if parts.len() != 3 || parts[2] != "HTTP/1.1" {
            return Err(Error::MalformedRequest(format!(
                "Invalid request line: {}",
                request_line
            )));
        }

        let method = parts[0];
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(Error::MalformedRequest(format!("Invalid method: {}", method)));
        }

        let path = parts[1];
        if !path.starts_with('/') {
            return Err(Error::MalformedRequest(format!("Invalid path: {}", path)));
        }

        let unique = [
            "host",
            "upgrade",
            "origin",
            "sec-websocket-key1",
            "sec-websocket-key2",
        ];
        let headers = parse_headers(lines, &unique)?;

        let upgrade = headers.get("upgrade").ok_or(Error::NotWebSocket)?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::NotWebSocket);
        }

        if headers.contains_key("sec-websocket-key") || headers.contains_key("sec-websocket-version") {
            return Err(Error::MalformedRequest(
                "RFC 6455 handshakes are not supported".into(),
            ));
        }

        let host = headers
            .get("host")
            .ok_or_else(|| Error::MalformedRequest("Missing Host header".into()))?
            .clone();

        let key1 = headers.get("sec-websocket-key1").cloned();
        let key2 = headers.get("sec-websocket-key2").cloned();
        if key1.is_some() != key2.is_some() {
            return Err(Error::MalformedRequest(
                "Only one of Sec-WebSocket-Key1/Key2 present".into(),
            ));
        }

        let protocol_header = if key1.is_some() {
            "sec-websocket-protocol"
        } else {
            "websocket-protocol"
        };
        let protocols = headers
            .get(protocol_header)
            .map(|p| {
                p.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let request = Self {
            method: method.to_string(),
            path: path.to_string(),
            origin: headers.get("origin").cloned(),
            host,
            key1,
            key2,
            key3: None,
            protocols,
            headers,
        };

        // Surface key errors before waiting for key3.
        request.key_numbers()?;

        Ok(request)
    }

    /// Parse a complete request from the front of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed, or the request with
    /// `key3` filled in and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeTooLarge`] if the request exceeds `max_size`.
    /// - Any error from [`HandshakeRequest::parse`].
    pub fn try_parse(buf: &[u8], max_size: usize) -> Result<Option<(Self, usize)>> {
        let too_large = |size| Error::HandshakeTooLarge {
            size,
            max: max_size,
        };

        let Some(head_end) = find_header_end(buf) else {
            if buf.len() > max_size {
                return Err(too_large(buf.len()));
            }
            return Ok(None);
        };

        let mut request = Self::parse(&buf[..head_end])?;
        let total = match request.version() {
            ProtocolVersion::Hixie76 => head_end + KEY3_LEN,
            ProtocolVersion::Hixie75 => head_end,
        };
        if total > max_size {
            return Err(too_large(total));
        }
        if buf.len() < total {
            return Ok(None);
        }

        if request.version() == ProtocolVersion::Hixie76 {
            let mut key3 = [0u8; KEY3_LEN];
            key3.copy_from_slice(&buf[head_end..total]);
            request.key3 = Some(key3);
        }

        Ok(Some((request, total)))
    }

    /// The draft this request follows.
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        if self.key1.is_some() {
            ProtocolVersion::Hixie76
        } else {
            ProtocolVersion::Hixie75
        }
    }

    /// The numbers encoded in `key1` and `key2`, if present.
    ///
    /// # Errors
    ///
    /// Returns the error from [`key_number`] for either key.
    pub fn key_numbers(&self) -> Result<Option<(u32, u32)>> {
        match (&self.key1, &self.key2) {
            (Some(k1), Some(k2)) => Ok(Some((key_number(k1, "key1")?, key_number(k2, "key2")?))),
            _ => Ok(None),
        }
    }

    /// Whether the client offered the `base64` sub-protocol.
    #[must_use]
    pub fn offers_base64(&self) -> bool {
        self.protocols.iter().any(|p| p == BASE64_PROTOCOL)
    }

    /// Look up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Legacy handshake response from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Prefix of the echoed headers (`"Sec-"` for Hixie-76, empty for Hixie-75).
    pub prefix: String,
    /// Echoed origin.
    pub origin: String,
    /// `ws://host/path` or `wss://host/path`.
    pub location: String,
    /// Accepted sub-protocol, if any.
    pub protocol: Option<String>,
    /// Challenge response (Hixie-76 only).
    pub digest: Option<[u8; 16]>,
}

impl HandshakeResponse {
    /// Create a response for a complete request.
    ///
    /// `prefix` applies to Hixie-76 only. `secure` selects the `wss` scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRequest`] if a Hixie-76 request lacks `key3`,
    /// or the key errors from [`HandshakeRequest::key_numbers`].
    pub fn from_request(req: &HandshakeRequest, prefix: &str, secure: bool) -> Result<Self> {
        let digest = match req.key_numbers()? {
            Some((num1, num2)) => {
                let key3 = req
                    .key3
                    .as_ref()
                    .ok_or_else(|| Error::MalformedRequest("Missing key3".into()))?;
                Some(compute_digest(num1, num2, key3))
            }
            None => None,
        };

        let scheme = if secure { "wss" } else { "ws" };
        Ok(Self {
            prefix: match req.version() {
                ProtocolVersion::Hixie76 => prefix.to_string(),
                ProtocolVersion::Hixie75 => String::new(),
            },
            origin: req.origin.clone().unwrap_or_else(|| "null".to_string()),
            location: format!("{}://{}{}", scheme, req.host, req.path),
            protocol: req.offers_base64().then(|| BASE64_PROTOCOL.to_string()),
            digest,
        })
    }

    /// Write the response to a buffer.
    ///
    /// The digest follows the blank line with no trailing line terminator.
    ///
    /// # Errors
    /// Returns `Error::MalformedRequest` if an echoed value contains CR/LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("Origin", &self.origin)?;
        validate_header_value("Location", &self.location)?;
        validate_header_value("Prefix", &self.prefix)?;

        buf.extend_from_slice(STATUS_LINE.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(b"Upgrade: WebSocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(
            format!("{}WebSocket-Origin: {}\r\n", self.prefix, self.origin).as_bytes(),
        );
        buf.extend_from_slice(
            format!("{}WebSocket-Location: {}\r\n", self.prefix, self.location).as_bytes(),
        );

        if let Some(ref proto) = self.protocol {
            validate_header_value("Protocol", proto)?;
            buf.extend_from_slice(
                format!("{}WebSocket-Protocol: {}\r\n", self.prefix, proto).as_bytes(),
            );
        }

        buf.extend_from_slice(b"\r\n");
        if let Some(ref digest) = self.digest {
            buf.extend_from_slice(digest);
        }
        Ok(())
    }
}
