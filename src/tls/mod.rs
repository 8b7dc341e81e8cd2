//! TLS termination for client connections.
//!
//! A single listening port serves both `wss://` and `ws://` clients: the
//! first byte of each connection decides whether it is wrapped in TLS.
//! Targets are always reached over plain TCP.
//!
//! Requires the `tls-rustls` feature.

mod rustls_impl;

pub use rustls_impl::{
    ClientStream, TlsAcceptor, TlsError, is_tls_client_hello, load_certs_from_file,
    load_private_key_from_file,
};

use std::sync::Arc;
use tokio_rustls::rustls::ServerConfig;

/// Build a server configuration from a certificate chain and its key.
///
/// # Errors
///
/// Returns [`TlsError::Configuration`] if rustls rejects the pair.
pub fn server_config(
    cert_chain: Vec<rustls::pki_types::CertificateDer<'static>>,
    private_key: rustls::pki_types::PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| TlsError::Configuration(e.to_string()))?;

    Ok(Arc::new(config))
}
