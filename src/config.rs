//! Configuration and limits for the relay.

use std::time::Duration;

/// Resource limits for a single connection.
///
/// These bound memory use per session regardless of how the peers behave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of the upgrade request, including the 8 key bytes.
    ///
    /// Default: 4 KB (4096)
    pub max_handshake_size: usize,

    /// Maximum size of an unterminated client frame held across reads.
    ///
    /// Default: 1 MB (1024 * 1024)
    pub max_carry_size: usize,

    /// Queue size above which reads from the producing side pause.
    ///
    /// Applies separately to the client-bound and the target-bound queue.
    ///
    /// Default: 1 MB (1024 * 1024)
    pub max_queued_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_handshake_size: 4096,
            max_carry_size: 1024 * 1024,
            max_queued_bytes: 1024 * 1024,
        }
    }
}

impl Limits {
    /// Create new limits with custom values.
    #[must_use]
    pub const fn new(max_handshake_size: usize, max_carry_size: usize, max_queued_bytes: usize) -> Self {
        Self {
            max_handshake_size,
            max_carry_size,
            max_queued_bytes,
        }
    }

    /// Whether a queue holding `queued` bytes should stop accepting input.
    #[inline]
    #[must_use]
    pub const fn is_saturated(&self, queued: usize) -> bool {
        queued >= self.max_queued_bytes
    }
}

/// Timeout configuration.
///
/// The relay loop itself has no idle timeout; sessions may live indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Time allowed for the complete upgrade request to arrive.
    ///
    /// Default: 3 seconds
    pub handshake: Duration,

    /// Time allowed to connect to the target.
    ///
    /// Default: 5 seconds
    pub connect: Duration,

    /// Time allowed to flush queued client data and the close frame when a
    /// session ends.
    ///
    /// Default: 1 second
    pub close: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(3),
            connect: Duration::from_secs(5),
            close: Duration::from_secs(1),
        }
    }
}

impl Timeouts {
    /// Create new timeouts with custom values.
    #[must_use]
    pub const fn new(handshake: Duration, connect: Duration, close: Duration) -> Self {
        Self {
            handshake,
            connect,
            close,
        }
    }
}

/// What to do when a client does not advertise the `base64` sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Base64Policy {
    /// Log a warning and continue without a protocol header.
    #[default]
    Warn,
    /// Reject the handshake.
    Require,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource limits.
    pub limits: Limits,

    /// Timeout configuration.
    pub timeouts: Timeouts,

    /// Size of a single read from either socket (in bytes).
    ///
    /// Default: 64 KB (65536)
    pub read_buffer_size: usize,

    /// Maximum number of concurrently served connections. Never below 1.
    ///
    /// Default: 100
    pub max_connections: usize,

    /// Prefix for the echoed `WebSocket-Origin`, `WebSocket-Location` and
    /// `WebSocket-Protocol` response headers of a Hixie-76 handshake.
    ///
    /// Default: `"Sec-"`
    pub header_prefix: String,

    /// Handling of clients that do not offer `base64`.
    ///
    /// Default: [`Base64Policy::Warn`]
    pub base64_policy: Base64Policy,

    /// Let an `a.b.c.d:port` token in the request path override the target.
    ///
    /// Default: true
    pub path_target_override: bool,

    /// Ports a path override may select. `None` allows any port.
    ///
    /// Default: None
    pub allowed_target_ports: Option<Vec<u16>>,

    /// Answer `<policy-file-request/>` with a permissive Flash policy.
    ///
    /// Default: true
    pub flash_policy: bool,

    /// Accept Hixie-75 requests, which carry no key headers.
    ///
    /// Default: true
    pub allow_hixie75: bool,

    /// Treat a client buffer that starts with `0x00 0xFF` as a partial frame
    /// instead of an empty one.
    ///
    /// Default: false
    pub legacy_partial_sentinel: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            read_buffer_size: 65536,
            max_connections: 100,
            header_prefix: "Sec-".to_string(),
            base64_policy: Base64Policy::Warn,
            path_target_override: true,
            allowed_target_ports: None,
            flash_policy: true,
            allow_hixie75: true,
            legacy_partial_sentinel: false,
        }
    }
}

impl Config {
    /// Create a new configuration with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set timeout configuration.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set read buffer size.
    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the concurrent connection cap; 0 is raised to 1.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = if max == 0 { 1 } else { max };
        self
    }

    /// Set the response header prefix.
    #[must_use]
    pub fn with_header_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.header_prefix = prefix.into();
        self
    }

    /// Set the `base64` sub-protocol policy.
    #[must_use]
    pub const fn with_base64_policy(mut self, policy: Base64Policy) -> Self {
        self.base64_policy = policy;
        self
    }

    /// Enable or disable path-based target overrides.
    #[must_use]
    pub const fn with_path_target_override(mut self, enabled: bool) -> Self {
        self.path_target_override = enabled;
        self
    }

    /// Restrict path overrides to the given ports.
    #[must_use]
    pub fn with_allowed_target_ports(mut self, ports: Vec<u16>) -> Self {
        self.allowed_target_ports = Some(ports);
        self
    }

    /// Enable or disable the Flash policy responder.
    #[must_use]
    pub const fn with_flash_policy(mut self, enabled: bool) -> Self {
        self.flash_policy = enabled;
        self
    }

    /// Enable or disable Hixie-75 requests.
    #[must_use]
    pub const fn with_hixie75(mut self, enabled: bool) -> Self {
        self.allow_hixie75 = enabled;
        self
    }

    /// Enable the legacy `0x00 0xFF` partial-frame rule.
    #[must_use]
    pub const fn with_legacy_partial_sentinel(mut self, enabled: bool) -> Self {
        self.legacy_partial_sentinel = enabled;
        self
    }
}
