//! Which side of a relay session a connection faces.

/// Side of a relay session.
///
/// The client speaks framed WebSocket traffic; the target speaks raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Browser-facing connection carrying `0x00 … 0xFF` frames.
    Client,
    /// Plain TCP connection to the proxied service.
    Target,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Target => write!(f, "target"),
        }
    }
}
