//! Authentication gate run after the handshake, before the target is dialled.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use crate::protocol::HandshakeRequest;
use crate::server::TargetAddr;

/// What an [`Authenticator`] gets to see about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote address of the client socket.
    pub peer: SocketAddr,
    /// Request path, query string included.
    pub path: String,
    /// Request headers, keyed by lower-cased name.
    pub headers: HashMap<String, String>,
    /// Origin header, if sent.
    pub origin: Option<String>,
    /// Host header.
    pub host: String,
    /// Target the session would connect to.
    pub target: TargetAddr,
    /// Whether the client connection is encrypted.
    pub secure: bool,
}

impl ConnectionInfo {
    /// Collect the details of an upgraded request.
    #[must_use]
    pub fn new(peer: SocketAddr, request: &HandshakeRequest, target: TargetAddr, secure: bool) -> Self {
        Self {
            peer,
            path: request.path.clone(),
            headers: request.headers.clone(),
            origin: request.origin.clone(),
            host: request.host.clone(),
            target,
            secure,
        }
    }
}

/// Boxed answer of an [`Authenticator`].
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Decides whether a connection may proceed to its target.
///
/// Answers may be immediate or deferred. A `false` answer closes the client
/// before any target connection exists.
pub trait Authenticator: Send + Sync {
    /// Check a connection.
    fn authenticate<'a>(&'a self, info: &'a ConnectionInfo) -> AuthFuture<'a>;
}

/// Admits every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate<'a>(&'a self, _info: &'a ConnectionInfo) -> AuthFuture<'a> {
        Box::pin(std::future::ready(true))
    }
}

/// Admits connections whose `Origin` is in a fixed list.
#[derive(Debug, Clone, Default)]
pub struct ExpectOrigin {
    origins: Vec<String>,
}

impl ExpectOrigin {
    /// Create a gate accepting the given origins.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origins: origins.into_iter().map(Into::into).collect(),
        }
    }

    /// The accepted origins.
    #[must_use]
    pub fn origins(&self) -> &[String] {
        &self.origins
    }
}

impl Authenticator for ExpectOrigin {
    fn authenticate<'a>(&'a self, info: &'a ConnectionInfo) -> AuthFuture<'a> {
        let allowed = info
            .origin
            .as_ref()
            .is_some_and(|origin| self.origins.contains(origin));
        if !allowed {
            tracing::debug!(
                expected = ?self.origins,
                actual = info.origin.as_deref().unwrap_or("-"),
                "invalid origin"
            );
        }
        Box::pin(std::future::ready(allowed))
    }
}

/// Wraps a synchronous predicate.
pub struct FnAuthenticator<F>(pub F);

impl<F> Authenticator for FnAuthenticator<F>
where
    F: Fn(&ConnectionInfo) -> bool + Send + Sync,
{
    fn authenticate<'a>(&'a self, info: &'a ConnectionInfo) -> AuthFuture<'a> {
        Box::pin(std::future::ready((self.0)(info)))
    }
}

impl<F> std::fmt::Debug for FnAuthenticator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAuthenticator").finish_non_exhaustive()
    }
}
