//! Reads the upgrade request off a fresh connection and answers it.
//!
//! The negotiator owns the bounded wait for the request, the Flash policy
//! responder and the `base64` policy. Parsing and serialization live in
//! [`crate::protocol::handshake`].

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

use crate::config::{Base64Policy, Config};
use crate::error::{Error, Result};
use crate::protocol::handshake::{
    FLASH_POLICY_REQUEST, FLASH_POLICY_RESPONSE, HandshakeRequest, HandshakeResponse,
    ProtocolVersion, is_flash_policy_prefix,
};

/// A completed upgrade.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The validated request, `key3` included.
    pub request: HandshakeRequest,
    /// Bytes that arrived after the request in the same reads.
    ///
    /// These are client frame data and must be decoded before anything
    /// read later.
    pub leftover: Bytes,
}

/// Outcome of [`HandshakeNegotiator::negotiate`].
#[derive(Debug, Clone)]
pub enum Negotiation {
    /// The response was written; the stream now carries frames.
    Upgraded(Handshake),
    /// A Flash policy request was answered. The stream should be closed.
    PolicyServed,
}

/// Drives the legacy handshake over an async stream.
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator<'a> {
    config: &'a Config,
    secure: bool,
}

impl<'a> HandshakeNegotiator<'a> {
    /// Create a negotiator for a plain (`ws://`) connection.
    #[must_use]
    pub const fn new(config: &'a Config) -> Self {
        Self {
            config,
            secure: false,
        }
    }

    /// Mark the transport as encrypted, so `Location` uses `wss://`.
    #[must_use]
    pub const fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Read the request, validate it and write the response.
    ///
    /// Nothing is written on failure; the caller closes the stream.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeTimeout`] if the request is not complete within
    ///   `timeouts.handshake`.
    /// - [`Error::MalformedRequest`] if the stream ends early, the request is
    ///   invalid, or it is a disabled Hixie-75 request.
    /// - [`Error::Base64NotOffered`] under [`Base64Policy::Require`].
    /// - Any parse error from [`HandshakeRequest::try_parse`].
    /// - [`Error::Io`] if reading or writing fails.
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<Negotiation>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + self.config.timeouts.handshake;
        let max_size = self.config.limits.max_handshake_size;
        let mut buf = BytesMut::with_capacity(1024);

        let (request, consumed) = loop {
            if self.config.flash_policy && is_flash_policy_prefix(&buf) {
                if buf.len() >= FLASH_POLICY_REQUEST.len() {
                    tracing::debug!("serving flash policy");
                    stream.write_all(FLASH_POLICY_RESPONSE).await?;
                    stream.flush().await?;
                    return Ok(Negotiation::PolicyServed);
                }
            } else if let Some(parsed) = HandshakeRequest::try_parse(&buf, max_size)? {
                break parsed;
            }

            let n = timeout_at(deadline, stream.read_buf(&mut buf))
                .await
                .map_err(|_| Error::HandshakeTimeout)??;
            if n == 0 {
                return Err(Error::MalformedRequest(format!(
                    "connection closed after {} bytes",
                    buf.len()
                )));
            }
        };

        let version = request.version();
        if version == ProtocolVersion::Hixie75 && !self.config.allow_hixie75 {
            return Err(Error::MalformedRequest(
                "Hixie-75 handshakes are disabled".into(),
            ));
        }

        if !request.offers_base64() {
            match self.config.base64_policy {
                Base64Policy::Warn => {
                    tracing::warn!(path = %request.path, "client did not offer the base64 sub-protocol");
                }
                Base64Policy::Require => return Err(Error::Base64NotOffered),
            }
        }

        let response = HandshakeResponse::from_request(&request, &self.config.header_prefix, self.secure)?;
        let mut out = Vec::with_capacity(256);
        response.write(&mut out)?;
        stream.write_all(&out).await?;
        stream.flush().await?;

        tracing::debug!(
            %version,
            path = %request.path,
            origin = request.origin.as_deref().unwrap_or("-"),
            "handshake complete"
        );

        buf.advance(consumed);
        Ok(Negotiation::Upgraded(Handshake {
            request,
            leftover: buf.freeze(),
        }))
    }
}
