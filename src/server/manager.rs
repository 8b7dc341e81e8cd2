//! Accept loop: one task per client, bounded by a connection semaphore.
//!
//! # Responsibilities
//! - Bind the listening socket
//! - Enforce `max_connections` via semaphore
//! - Allocate session ids
//! - Drive handshake, target selection, authentication and the relay

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::config::Config;
use crate::connection::{ProxySession, SessionReport};
use crate::error::{Error, Result};
use crate::negotiator::{HandshakeNegotiator, Negotiation};
use crate::server::{AllowAll, Authenticator, ConnectionInfo, TargetAddr, TargetResolver, TokenFile, connect};

#[cfg(feature = "tls-rustls")]
use crate::tls::{ClientStream, TlsAcceptor};

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State every connection task reads; nothing here is mutated after `serve`.
struct Shared {
    config: Config,
    resolver: TargetResolver,
    auth: Arc<dyn Authenticator>,
    #[cfg(feature = "tls-rustls")]
    tls: Option<TlsAcceptor>,
}

/// Accepts clients and runs one isolated relay session per connection.
///
/// Sessions share nothing but the id counter, which only the accept loop
/// touches.
pub struct ConnectionManager {
    listener: TcpListener,
    config: Config,
    resolver: TargetResolver,
    auth: Arc<dyn Authenticator>,
    #[cfg(feature = "tls-rustls")]
    tls: Option<TlsAcceptor>,
    connection_limit: Arc<Semaphore>,
    next_session_id: AtomicU64,
}

impl ConnectionManager {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound. This is the
    /// only error that should stop the process.
    pub async fn bind<A: ToSocketAddrs>(addr: A, target: TargetAddr, config: Config) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let manager = Self::from_listener(listener, target, config);

        tracing::info!(
            address = %manager.local_addr()?,
            target = %manager.resolver.default_target(),
            max_connections = manager.config.max_connections,
            "listener bound"
        );
        Ok(manager)
    }

    /// Wrap an already bound listener.
    #[must_use]
    pub fn from_listener(listener: TcpListener, target: TargetAddr, config: Config) -> Self {
        Self {
            listener,
            resolver: TargetResolver::new(target, &config),
            auth: Arc::new(AllowAll),
            #[cfg(feature = "tls-rustls")]
            tls: None,
            // A zero-permit semaphore would never accept.
            connection_limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            next_session_id: AtomicU64::new(1),
            config,
        }
    }

    /// Pick targets by the `token` in each request.
    ///
    /// Once set, a request without a known token is refused and the path
    /// override is not consulted.
    #[must_use]
    pub fn with_tokens(mut self, tokens: TokenFile) -> Self {
        tracing::info!(tokens = tokens.len(), "token targets loaded");
        self.resolver = self.resolver.with_tokens(tokens);
        self
    }

    /// Gate connections with an authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, auth: impl Authenticator + 'static) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// Terminate TLS on client connections.
    #[cfg(feature = "tls-rustls")]
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Local address of the listening socket.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connection slots currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// When the limit is reached, accepting waits for a slot; further
    /// clients queue in the listen backlog. Sessions already running are
    /// left to finish on their own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection semaphore is closed.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ConnectionManager {
            listener,
            config,
            resolver,
            auth,
            #[cfg(feature = "tls-rustls")]
            tls,
            connection_limit,
            next_session_id,
        } = self;

        let shared = Arc::new(Shared {
            config,
            resolver,
            auth,
            #[cfg(feature = "tls-rustls")]
            tls,
        });

        tokio::pin!(shutdown);

        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = connection_limit.clone().acquire_owned() => permit
                    .map_err(|_| Error::Io("connection limit closed".into()))?,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let id = next_session_id.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                session = id,
                %peer,
                available_permits = connection_limit.available_permits(),
                "connection accepted"
            );

            let shared = Arc::clone(&shared);
            let span = tracing::info_span!("session", id, %peer);
            tokio::spawn(
                async move {
                    // Released when the task ends, panics included.
                    let _permit = permit;
                    handle_connection(&shared, stream, peer).await;
                }
                .instrument(span),
            );
        }

        tracing::info!("listener stopped");
        Ok(())
    }
}

async fn handle_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY on client socket");
    }

    match accept_and_relay(shared, stream, peer).await {
        Ok(Some(report)) if report.is_orderly() => tracing::info!(
            reason = %report.reason,
            to_target = report.client_to_target,
            to_client = report.target_to_client,
            "session ended"
        ),
        Ok(Some(report)) => tracing::warn!(
            reason = %report.reason,
            to_target = report.client_to_target,
            to_client = report.target_to_client,
            "session failed"
        ),
        Ok(None) => tracing::debug!("flash policy served"),
        Err(e) if e.is_handshake_failure() => tracing::info!(error = %e, "handshake failed"),
        Err(e) => tracing::info!(error = %e, "connection rejected"),
    }
}

#[cfg(feature = "tls-rustls")]
async fn accept_and_relay(shared: &Shared, stream: TcpStream, peer: SocketAddr) -> Result<Option<SessionReport>> {
    let stream = match shared.tls {
        Some(ref acceptor) => tokio::time::timeout(shared.config.timeouts.handshake, acceptor.accept(stream))
            .await
            .map_err(|_| Error::HandshakeTimeout)??,
        None => ClientStream::Plain(stream),
    };
    let secure = stream.is_secure();
    relay(shared, stream, peer, secure).await
}

#[cfg(not(feature = "tls-rustls"))]
async fn accept_and_relay(shared: &Shared, stream: TcpStream, peer: SocketAddr) -> Result<Option<SessionReport>> {
    relay(shared, stream, peer, false).await
}

/// Handshake, target selection, authentication, then the session.
///
/// Returns `None` when a Flash policy request was answered.
async fn relay<S>(shared: &Shared, mut stream: S, peer: SocketAddr, secure: bool) -> Result<Option<SessionReport>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let negotiation = HandshakeNegotiator::new(&shared.config)
        .with_secure(secure)
        .negotiate(&mut stream)
        .await?;
    let Negotiation::Upgraded(handshake) = negotiation else {
        return Ok(None);
    };

    let request = &handshake.request;
    let target = shared.resolver.resolve(&request.path, request.header("cookie"))?;

    let info = ConnectionInfo::new(peer, &handshake.request, target.clone(), secure);
    if !shared.auth.authenticate(&info).await {
        return Err(Error::AuthDenied);
    }

    let target_stream = connect(&target, shared.config.timeouts.connect).await?;
    tracing::info!(%target, path = %handshake.request.path, secure, "relaying");

    let report = ProxySession::new(stream, target_stream, &shared.config)
        .with_leftover(handshake.leftover)
        .run()
        .await;
    Ok(Some(report))
}
