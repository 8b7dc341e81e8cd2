//! Relay sessions between a WebSocket client and a TCP target.
//!
//! A [`ProxySession`] owns one upgraded client stream and one target
//! stream and relays between them until either side ends.
//!
//! ## Session Lifecycle
//!
//! 1. **Relaying** - Both directions are pumped until the first terminal condition
//! 2. **Flushing** - Queued data and the close frame are written, bounded by `timeouts.close`
//! 3. **Done** - Both connections are shut down and a [`SessionReport`] is returned
//!
//! ## Example
//!
//! ```rust,ignore
//! use wsrelay::{Config, ProxySession};
//!
//! let target = tokio::net::TcpStream::connect("127.0.0.1:5900").await?;
//! let report = ProxySession::new(client, target, &config)
//!     .with_leftover(handshake.leftover)
//!     .run()
//!     .await;
//! println!("session ended: {}", report.reason);
//! ```

mod queue;
mod role;
mod session;

pub use queue::ChunkQueue;
pub use role::Role;
pub use session::{ProxySession, SessionReport};
