//! Relays and TCP targets bound to random local ports.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use wsrelay::server::{Authenticator, ConnectionManager, TargetAddr};
use wsrelay::Config;

/// TCP target that echoes every byte back on each connection.
pub struct EchoTarget {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl EchoTarget {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        Self { addr, handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn target(&self) -> TargetAddr {
        TargetAddr::new("127.0.0.1", self.addr.port())
    }
}

impl Drop for EchoTarget {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// TCP target that writes a fixed reply to each connection and hangs up.
pub struct ReplyTarget {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ReplyTarget {
    pub async fn spawn(reply: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = stream.write_all(reply).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Self { addr, handle }
    }

    pub fn target(&self) -> TargetAddr {
        TargetAddr::new("127.0.0.1", self.addr.port())
    }
}

impl Drop for ReplyTarget {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A relay serving in the background until shut down.
pub struct TestRelay {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<wsrelay::Result<()>>>,
}

impl TestRelay {
    /// Spawn a relay with the default configuration.
    pub async fn spawn(target: TargetAddr) -> (Self, SocketAddr) {
        Self::spawn_with_config(target, Config::default()).await
    }

    pub async fn spawn_with_config(target: TargetAddr, config: Config) -> (Self, SocketAddr) {
        let manager = ConnectionManager::bind("127.0.0.1:0", target, config)
            .await
            .unwrap();
        Self::start(manager)
    }

    pub async fn spawn_with_authenticator(
        target: TargetAddr,
        auth: impl Authenticator + 'static,
    ) -> (Self, SocketAddr) {
        let manager = ConnectionManager::bind("127.0.0.1:0", target, Config::default())
            .await
            .unwrap()
            .with_authenticator(auth);
        Self::start(manager)
    }

    /// Serve a manager prepared by the caller.
    pub fn start(manager: ConnectionManager) -> (Self, SocketAddr) {
        let addr = manager.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(manager.serve(async move {
            let _ = rx.await;
        }));
        let relay = Self {
            addr,
            shutdown: Some(tx),
            handle: Some(handle),
        };
        (relay, addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
