//! Hixie frame encoding and decoding.
//!
//! A frame is `0x00`, the base64 text of the payload, then `0xFF`. The
//! two-byte sequence `0xFF 0x00` is an orderly close. Decoding is sans-I/O:
//! callers feed raw reads and get back complete payloads, while the bytes of
//! an unterminated frame are carried into the next call.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// First byte of every data frame.
pub const FRAME_START: u8 = 0x00;

/// Last byte of every data frame.
pub const FRAME_END: u8 = 0xFF;

/// The orderly close frame.
pub const CLOSE_FRAME: [u8; 2] = [FRAME_END, FRAME_START];

/// The legacy partial-frame marker, which is also the encoding of an empty payload.
pub const PARTIAL_SENTINEL: [u8; 2] = [FRAME_START, FRAME_END];

/// Number of bytes `encode` produces for a payload of `len` bytes.
#[inline]
#[must_use]
pub const fn encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4 + 2
}

/// Encode one payload as a complete frame.
///
/// # Example
///
/// ```
/// use wsrelay::protocol::frame::encode;
///
/// assert_eq!(&encode(b"hello")[..], b"\x00aGVsbG8=\xff");
/// ```
#[must_use]
pub fn encode(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(encoded_len(payload.len()));
    encode_into(payload, &mut dst);
    dst.freeze()
}

/// Append the frame for `payload` to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(encoded_len(payload.len()));
    dst.extend_from_slice(&[FRAME_START]);
    // The standard engine never emits line breaks.
    let text = BASE64.encode(payload);
    dst.extend_from_slice(text.as_bytes());
    dst.extend_from_slice(&[FRAME_END]);
}

fn decode_payload(text: &[u8]) -> Result<Bytes> {
    let decoded = if text.iter().any(|&b| b == b'\r' || b == b'\n') {
        let stripped: Vec<u8> = text
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();
        BASE64.decode(stripped)
    } else {
        BASE64.decode(text)
    };
    decoded
        .map(Bytes::from)
        .map_err(|e| Error::InvalidFrame(format!("invalid base64 payload: {}", e)))
}

/// Payloads produced by one [`FrameDecoder::push`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frames {
    /// Complete payloads in arrival order.
    pub payloads: Vec<Bytes>,
    /// The peer sent an orderly close.
    pub closed: bool,
}

/// Result of the stateless [`decode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Complete payloads in arrival order.
    pub payloads: Vec<Bytes>,
    /// Bytes to prepend to the next read.
    pub carry: Bytes,
    /// The peer sent an orderly close.
    pub closed: bool,
}

/// Decode `buffer` after prepending `carry` from the previous call.
///
/// Uses the default rules: a frame whose terminator has not arrived is carried
/// and `0x00 0xFF` is an empty payload.
///
/// # Errors
///
/// Returns [`Error::InvalidFrame`] if a frame does not start with `0x00` or its
/// payload is not valid base64.
pub fn decode(buffer: &[u8], carry: &[u8]) -> Result<Decoded> {
    decode_with(buffer, carry, false)
}

/// [`decode`] with a choice of the `0x00 0xFF` rule.
///
/// With `legacy_partial_sentinel` set, a buffer that starts with `0x00 0xFF`
/// while nothing is carried is returned whole as carry.
///
/// ```
/// use wsrelay::protocol::frame::decode_with;
///
/// let decoded = decode_with(b"\x00\xff", b"", true).unwrap();
/// assert!(decoded.payloads.is_empty());
/// assert_eq!(&decoded.carry[..], b"\x00\xff");
/// ```
///
/// # Errors
///
/// Same as [`decode`].
pub fn decode_with(buffer: &[u8], carry: &[u8], legacy_partial_sentinel: bool) -> Result<Decoded> {
    let mut decoder = FrameDecoder::with_carry(carry).with_legacy_partial_sentinel(legacy_partial_sentinel);
    let frames = decoder.push(buffer)?;
    Ok(Decoded {
        payloads: frames.payloads,
        carry: decoder.into_carry(),
        closed: frames.closed,
    })
}

/// Per-connection frame decoder holding the partial-frame carry.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    carry: BytesMut,
    legacy_partial_sentinel: bool,
    max_carry: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with an empty carry and no carry limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            carry: BytesMut::new(),
            legacy_partial_sentinel: false,
            max_carry: usize::MAX,
        }
    }

    /// Create a decoder whose next push is prefixed with `carry`.
    #[must_use]
    pub fn with_carry(carry: &[u8]) -> Self {
        let mut decoder = Self::new();
        decoder.carry.extend_from_slice(carry);
        decoder
    }

    /// Treat a buffer starting with `0x00 0xFF` as partial when nothing is carried.
    #[must_use]
    pub const fn with_legacy_partial_sentinel(mut self, enabled: bool) -> Self {
        self.legacy_partial_sentinel = enabled;
        self
    }

    /// Bound the number of bytes an unterminated frame may occupy.
    #[must_use]
    pub const fn with_max_carry(mut self, max: usize) -> Self {
        self.max_carry = max;
        self
    }

    /// Bytes waiting for the rest of their frame.
    #[must_use]
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Consume the decoder, returning the carried bytes.
    #[must_use]
    pub fn into_carry(self) -> Bytes {
        self.carry.freeze()
    }

    /// Feed one raw read and return the payloads it completes.
    ///
    /// The carried bytes are always decoded before `chunk`. Once a close is
    /// seen the carry is discarded along with anything after the close frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] on a bad lead byte, bad base64, or an
    /// unterminated frame larger than the configured carry limit. Payloads
    /// completed before the bad frame are dropped; use
    /// [`FrameDecoder::push_into`] to keep them.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Frames> {
        let mut frames = Frames::default();
        frames.closed = self.push_into(chunk, &mut frames.payloads)?;
        Ok(frames)
    }

    /// Feed one raw read, appending completed payloads to `payloads`.
    ///
    /// Returns whether the peer sent an orderly close. On error, `payloads`
    /// still holds every frame that preceded the bad one and the carry is
    /// cleared.
    ///
    /// # Errors
    ///
    /// Same as [`FrameDecoder::push`].
    pub fn push_into(&mut self, chunk: &[u8], payloads: &mut Vec<Bytes>) -> Result<bool> {
        let sentinel_active = self.legacy_partial_sentinel && self.carry.is_empty();
        self.carry.extend_from_slice(chunk);

        if sentinel_active && self.carry.starts_with(&PARTIAL_SENTINEL) {
            return Ok(false);
        }

        let mut pos = 0;
        while pos < self.carry.len() {
            let rest = &self.carry[pos..];
            if rest.starts_with(&CLOSE_FRAME) {
                self.carry.clear();
                return Ok(true);
            }
            if rest == [FRAME_END] {
                // First half of a close frame.
                break;
            }
            if rest[0] != FRAME_START {
                let found = rest[0];
                self.carry.clear();
                return Err(Error::InvalidFrame(format!(
                    "expected frame start 0x00, got {:#04x}",
                    found
                )));
            }
            match rest[1..].iter().position(|&b| b == FRAME_END) {
                Some(end) => match decode_payload(&rest[1..=end]) {
                    Ok(payload) => {
                        payloads.push(payload);
                        pos += end + 2;
                    }
                    Err(e) => {
                        self.carry.clear();
                        return Err(e);
                    }
                },
                None => break,
            }
        }

        self.carry.advance(pos);
        if self.carry.len() > self.max_carry {
            self.carry.clear();
            return Err(Error::InvalidFrame(format!(
                "unterminated frame exceeds {} bytes",
                self.max_carry
            )));
        }
        Ok(false)
    }
}
