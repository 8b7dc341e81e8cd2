//! Target addresses and per-request target selection.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::SocketAddrV4;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::{Error, Result};

/// A `host:port` pair the relay connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    /// Create a target from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or address, without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for TargetAddr {
    type Err = Error;

    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`.
    ///
    /// The last colon separates the port.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTarget(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddrV4> for TargetAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Find an `a.b.c.d:port` token in a request path.
///
/// The path is split on `/ ? & = ;` and the first token that parses as an
/// IPv4 socket address wins.
///
/// ```
/// use wsrelay::server::target_from_path;
///
/// let target = target_from_path("/websockify?token=abc&target=10.0.0.5:5901").unwrap();
/// assert_eq!(target.to_string(), "10.0.0.5:5901");
/// assert!(target_from_path("/websockify").is_none());
/// ```
#[must_use]
pub fn target_from_path(path: &str) -> Option<TargetAddr> {
    path.split(['/', '?', '&', '=', ';'])
        .find_map(|token| token.parse::<SocketAddrV4>().ok())
        .map(TargetAddr::from)
}

/// Targets keyed by token, read from `token: host:port` lines.
///
/// Blank lines and lines starting with `#` are skipped. A line that does not
/// parse is logged and ignored, the same as an unknown token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenFile {
    targets: HashMap<String, TargetAddr>,
}

impl TokenFile {
    /// Load a token file, or every file in a directory of them.
    ///
    /// Files in a directory are read in name order; a later entry for the
    /// same token wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the path or one of its files cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(path)? {
                let file = entry?.path();
                if file.is_file() {
                    files.push(file);
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut tokens = Self::default();
        for file in files {
            let content = fs::read_to_string(&file)?;
            tokens.extend_from(&content, &file.display().to_string());
        }
        Ok(tokens)
    }

    /// Parse token lines held in memory.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut tokens = Self::default();
        tokens.extend_from(content, "<memory>");
        tokens
    }

    fn extend_from(&mut self, content: &str, source: &str) {
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = line
                .split_once(": ")
                .and_then(|(token, target)| Some((token.trim(), target.trim().parse::<TargetAddr>().ok()?)));
            match parsed {
                Some((token, target)) if !token.is_empty() => {
                    self.targets.insert(token.to_string(), target);
                }
                _ => tracing::warn!(source, line = index + 1, "syntax error in token file"),
            }
        }
    }

    /// The target registered for `token`.
    #[must_use]
    pub fn lookup(&self, token: &str) -> Option<&TargetAddr> {
        self.targets.get(token)
    }

    /// Number of known tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no token is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Find the session token of a request.
///
/// A cookie whose name contains `token` wins over a `token=` query
/// parameter. Values are matched verbatim.
///
/// ```
/// use wsrelay::server::token_from_request;
///
/// assert_eq!(token_from_request("/websockify?token=abc", None), Some("abc"));
/// assert_eq!(token_from_request("/?token=abc", Some("lang=en; token=xyz")), Some("xyz"));
/// assert_eq!(token_from_request("/websockify", None), None);
/// ```
#[must_use]
pub fn token_from_request<'a>(path: &'a str, cookie: Option<&'a str>) -> Option<&'a str> {
    let from_cookie = cookie.and_then(|cookie| {
        cookie
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| name.contains("token"))
            .map(|(_, value)| value)
    });
    let token = from_cookie.or_else(|| {
        let (_, query) = path.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == "token")
            .map(|(_, value)| value.trim_end_matches('\n'))
    })?;
    (!token.is_empty()).then_some(token)
}

/// Picks the target for each session.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    default: TargetAddr,
    path_override: bool,
    allowed_ports: Option<Vec<u16>>,
    tokens: Option<Arc<TokenFile>>,
}

impl TargetResolver {
    /// Create a resolver with a static default target.
    #[must_use]
    pub fn new(default: TargetAddr, config: &Config) -> Self {
        Self {
            default,
            path_override: config.path_target_override,
            allowed_ports: config.allowed_target_ports.clone(),
            tokens: None,
        }
    }

    /// Resolve every request through `tokens` instead of the path.
    #[must_use]
    pub fn with_tokens(mut self, tokens: TokenFile) -> Self {
        self.tokens = Some(Arc::new(tokens));
        self
    }

    /// The static target.
    #[must_use]
    pub fn default_target(&self) -> &TargetAddr {
        &self.default
    }

    /// Resolve the target for a request path and its `Cookie` header.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownToken`] if a token file is set and the request has
    ///   no token or an unknown one.
    /// - [`Error::TargetNotAllowed`] if the path selects a port outside the
    ///   configured whitelist.
    pub fn resolve(&self, path: &str, cookie: Option<&str>) -> Result<TargetAddr> {
        if let Some(ref tokens) = self.tokens {
            let token = token_from_request(path, cookie)
                .ok_or_else(|| Error::UnknownToken("token not present".into()))?;
            let target = tokens
                .lookup(token)
                .ok_or_else(|| Error::UnknownToken(format!("token '{}' not found", token)))?;
            tracing::debug!(%target, "target selected by token");
            return Ok(target.clone());
        }

        if !self.path_override {
            return Ok(self.default.clone());
        }
        let Some(target) = target_from_path(path) else {
            return Ok(self.default.clone());
        };

        if let Some(ref allowed) = self.allowed_ports {
            if !allowed.contains(&target.port) {
                return Err(Error::TargetNotAllowed(target.to_string()));
            }
        }

        tracing::debug!(%target, "target overridden by request path");
        Ok(target)
    }
}

/// Open a TCP connection to the target.
///
/// `TCP_NODELAY` is set on the new socket.
///
/// # Errors
///
/// Returns [`Error::TargetUnreachable`] if the connect fails or does not
/// finish within `timeout`.
pub async fn connect(target: &TargetAddr, timeout: Duration) -> Result<TcpStream> {
    let unreachable = |reason: String| Error::TargetUnreachable {
        target: target.to_string(),
        reason,
    };

    let stream = tokio::time::timeout(timeout, TcpStream::connect((target.host(), target.port())))
        .await
        .map_err(|_| unreachable(format!("connect timed out after {:?}", timeout)))?
        .map_err(|e| unreachable(e.to_string()))?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY on target socket");
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        let t: TargetAddr = "localhost:5900".parse().unwrap();
        assert_eq!(t.host(), "localhost");
        assert_eq!(t.port(), 5900);

        let t: TargetAddr = "10.1.2.3:22".parse().unwrap();
        assert_eq!(t.to_string(), "10.1.2.3:22");

        let t: TargetAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(t.host(), "::1");
        assert_eq!(t.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_parse_target_invalid() {
        for s in ["localhost", ":5900", "host:", "host:0", "host:70000", "::1:80", "[::1:80"] {
            let result = s.parse::<TargetAddr>();
            assert!(
                matches!(result, Err(Error::InvalidTarget(_))),
                "{:?} gave {:?}",
                s,
                result
            );
        }
    }

    #[test]
    fn test_target_from_path() {
        let cases = [
            ("/192.168.1.10:5901", Some("192.168.1.10:5901")),
            ("/ws?target=10.0.0.1:22", Some("10.0.0.1:22")),
            ("/a/1.2.3.4:80/5.6.7.8:81", Some("1.2.3.4:80")),
            ("/x;127.0.0.1:7000", Some("127.0.0.1:7000")),
            ("/host.example:80", None),
            ("/1.2.3.4", None),
            ("/999.1.1.1:80", None),
            ("/", None),
        ];
        for (path, expected) in cases {
            let got = target_from_path(path).map(|t| t.to_string());
            assert_eq!(got.as_deref(), expected, "path {:?}", path);
        }
    }

    #[test]
    fn test_resolver_default_and_override() {
        let default: TargetAddr = "localhost:5900".parse().unwrap();
        let resolver = TargetResolver::new(default.clone(), &Config::default());

        assert_eq!(resolver.resolve("/websockify", None).unwrap(), default);
        assert_eq!(
            resolver.resolve("/10.0.0.9:5999", None).unwrap().to_string(),
            "10.0.0.9:5999"
        );
    }

    #[test]
    fn test_resolver_override_disabled() {
        let default: TargetAddr = "localhost:5900".parse().unwrap();
        let config = Config::new().with_path_target_override(false);
        let resolver = TargetResolver::new(default.clone(), &config);
        assert_eq!(resolver.resolve("/10.0.0.9:5999", None).unwrap(), default);
    }

    #[test]
    fn test_resolver_port_whitelist() {
        let default: TargetAddr = "localhost:5900".parse().unwrap();
        let config = Config::new().with_allowed_target_ports(vec![5901, 5902]);
        let resolver = TargetResolver::new(default.clone(), &config);

        assert!(resolver.resolve("/10.0.0.9:5901", None).is_ok());
        assert_eq!(
            resolver.resolve("/10.0.0.9:22", None),
            Err(Error::TargetNotAllowed("10.0.0.9:22".into()))
        );
        // The static target is not subject to the whitelist.
        assert_eq!(resolver.resolve("/", None).unwrap(), default);
    }

    const TOKENS: &str = "# lab machines\n\
        vnc1: 10.0.0.1:5901\n\
        \n\
        vnc2:10.0.0.2:5902\n\
        ssh: [::1]:22\n\
        broken: nowhere\n";

    #[test]
    fn test_token_file_parse() {
        let tokens = TokenFile::parse(TOKENS);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.lookup("vnc1").unwrap().to_string(), "10.0.0.1:5901");
        assert_eq!(tokens.lookup("ssh").unwrap().host(), "::1");
        // No space after the colon, and no port.
        assert!(tokens.lookup("vnc2").is_none());
        assert!(tokens.lookup("broken").is_none());
    }

    #[test]
    fn test_token_file_load_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.conf"), "one: 10.0.0.1:1\nshared: 10.0.0.1:9\n").unwrap();
        fs::write(dir.path().join("b.conf"), "two: 10.0.0.2:2\nshared: 10.0.0.2:9\n").unwrap();

        let single = TokenFile::load(dir.path().join("a.conf")).unwrap();
        assert_eq!(single.len(), 2);
        assert!(single.lookup("two").is_none());

        let all = TokenFile::load(dir.path()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.lookup("shared").unwrap().to_string(), "10.0.0.2:9");

        let missing = TokenFile::load(dir.path().join("missing.conf"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_token_from_request() {
        assert_eq!(token_from_request("/?token=abc&x=1", None), Some("abc"));
        assert_eq!(token_from_request("/?x=1&token=abc", None), Some("abc"));
        assert_eq!(token_from_request("/?mytoken=abc", None), None);
        assert_eq!(token_from_request("/?token=", None), None);
        assert_eq!(token_from_request("/token=abc", None), None);
        assert_eq!(token_from_request("/", Some("vnc_token=c1; other=2")), Some("c1"));
        assert_eq!(token_from_request("/?token=q", Some("session=s")), Some("q"));
    }

    #[test]
    fn test_resolver_tokens() {
        let default: TargetAddr = "localhost:5900".parse().unwrap();
        let resolver = TargetResolver::new(default, &Config::default()).with_tokens(TokenFile::parse(TOKENS));

        assert_eq!(
            resolver.resolve("/websockify?token=vnc1", None).unwrap().to_string(),
            "10.0.0.1:5901"
        );
        assert_eq!(
            resolver.resolve("/", Some("token=ssh")).unwrap().to_string(),
            "[::1]:22"
        );
        assert_eq!(
            resolver.resolve("/websockify", None),
            Err(Error::UnknownToken("token not present".into()))
        );
        assert_eq!(
            resolver.resolve("/?token=nope", None),
            Err(Error::UnknownToken("token 'nope' not found".into()))
        );
        // Path overrides are not consulted once tokens are in use.
        assert!(resolver.resolve("/10.0.0.9:5999", None).is_err());
    }

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let target = TargetAddr::new("127.0.0.1", addr.port());

        let (stream, accepted) = tokio::join!(
            connect(&target, Duration::from_secs(1)),
            listener.accept()
        );
        let stream = stream.unwrap();
        assert!(accepted.is_ok());
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = TargetAddr::new("127.0.0.1", port);
        let result = connect(&target, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(Error::TargetUnreachable { target, .. }) if target == format!("127.0.0.1:{}", port)
        ));
    }
}
