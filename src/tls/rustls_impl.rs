use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;

#[derive(Debug)]
pub enum TlsError {
    Io(std::io::Error),
    Configuration(String),
    NoCertificatesFound,
    NoPrivateKeyFound,
    PlainRejected,
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "TLS I/O error: {}", e),
            TlsError::Configuration(msg) => write!(f, "TLS configuration error: {}", msg),
            TlsError::NoCertificatesFound => write!(f, "no certificates found in file"),
            TlsError::NoPrivateKeyFound => write!(f, "no private key found in file"),
            TlsError::PlainRejected => write!(f, "non-TLS connection rejected"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TlsError {
    fn from(err: std::io::Error) -> Self {
        TlsError::Io(err)
    }
}

impl From<TlsError> for crate::Error {
    fn from(err: TlsError) -> Self {
        crate::Error::Tls(err.to_string())
    }
}

/// Whether a connection's first byte opens a TLS ClientHello.
///
/// `0x16` is a TLS handshake record; `0x80` an SSLv2-compatible hello.
#[inline]
#[must_use]
pub const fn is_tls_client_hello(first_byte: u8) -> bool {
    first_byte == 0x16 || first_byte == 0x80
}

/// A client connection, encrypted or not.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl ClientStream {
    /// Whether the connection was wrapped in TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accepts TLS and, unless `tls_only` is set, plain connections on one port.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
    tls_only: bool,
}

impl TlsAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
            tls_only: false,
        }
    }

    /// Build an acceptor from PEM certificate chain and key files.
    ///
    /// # Errors
    ///
    /// Returns the loader errors or [`TlsError::Configuration`] if rustls
    /// rejects the pair.
    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self, TlsError> {
        let certs = load_certs_from_file(cert)?;
        let key = load_private_key_from_file(key)?;
        Ok(Self::new(super::server_config(certs, key)?))
    }

    /// Refuse connections that do not start with a TLS ClientHello.
    #[must_use]
    pub fn with_tls_only(mut self, tls_only: bool) -> Self {
        self.tls_only = tls_only;
        self
    }

    /// Peek at the first byte and wrap the stream if it is TLS.
    ///
    /// # Errors
    ///
    /// - [`TlsError::Io`] if the peer closes before sending anything or the
    ///   TLS handshake fails.
    /// - [`TlsError::PlainRejected`] for a plain connection when `tls_only`
    ///   is set.
    pub async fn accept(&self, stream: TcpStream) -> Result<ClientStream, TlsError> {
        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Err(TlsError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }

        if !is_tls_client_hello(first[0]) {
            if self.tls_only {
                return Err(TlsError::PlainRejected);
            }
            return Ok(ClientStream::Plain(stream));
        }

        let tls_stream = self.inner.accept(stream).await.map_err(TlsError::Io)?;
        tracing::debug!("TLS connection established");
        Ok(ClientStream::Tls(Box::new(tls_stream)))
    }
}

pub fn load_certs_from_file(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificatesFound);
    }

    Ok(certs)
}

pub fn load_private_key_from_file(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(TlsError::NoPrivateKeyFound)
}
