//! Listener side of the relay: target selection, authentication and the
//! accept loop.

mod auth;
mod manager;
mod target;

pub use auth::{AllowAll, AuthFuture, Authenticator, ConnectionInfo, ExpectOrigin, FnAuthenticator};
pub use manager::ConnectionManager;
pub use target::{TargetAddr, TargetResolver, TokenFile, connect, target_from_path, token_from_request};
