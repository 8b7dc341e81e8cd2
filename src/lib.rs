//! # wsrelay - WebSocket to TCP relay for legacy browser clients
//!
//! `wsrelay` accepts WebSocket connections speaking the pre-standard
//! Hixie-76 (and Hixie-75) drafts and relays them to a plain TCP service.
//! Client frames are `0x00`, base64 payload, `0xFF`; target traffic is an
//! opaque byte stream.
//!
//! ## Features
//!
//! - **Sans-I/O codec and handshake** in [`protocol`]
//! - **Ordered relay** with short-write handling and bounded queues
//! - **Per-request targets** via a `token: host:port` file, or `a.b.c.d:port` path tokens with a port whitelist
//! - **Pluggable authentication** through [`server::Authenticator`]
//! - **TLS termination** with plain/TLS auto-detection (feature `tls-rustls`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wsrelay::{Config, ConnectionManager};
//!
//! let target = "127.0.0.1:5900".parse()?;
//! let manager = ConnectionManager::bind("0.0.0.0:6080", target, Config::default()).await?;
//! manager.serve(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod server;

pub use config::{Base64Policy, Config, Limits, Timeouts};
pub use connection::{ChunkQueue, ProxySession, Role, SessionReport};
pub use error::{Error, Result};
pub use negotiator::{Handshake, HandshakeNegotiator, Negotiation};
pub use protocol::{FrameDecoder, HandshakeRequest, HandshakeResponse, ProtocolVersion};
pub use server::{ConnectionManager, TargetAddr};

#[cfg(feature = "tls-rustls")]
pub mod tls;
