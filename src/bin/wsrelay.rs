//! Command-line front end for the relay.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsrelay::server::{ExpectOrigin, TokenFile};
use wsrelay::{Base64Policy, Config, ConnectionManager, Limits, TargetAddr, Timeouts};

#[derive(Parser, Debug)]
#[command(name = "wsrelay")]
#[command(version, about = "Relay legacy (Hixie-76) WebSocket clients to a TCP service", long_about = None)]
struct Cli {
    /// Address to listen on, `[HOST:]PORT`
    listen: String,

    /// Default target, `HOST:PORT`
    target: TargetAddr,

    /// Maximum concurrent connections (at least 1)
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Prefix of the echoed WebSocket-* response headers
    #[arg(long, default_value = "Sec-")]
    header_prefix: String,

    /// Reject clients that do not offer the base64 sub-protocol
    #[arg(long)]
    require_base64: bool,

    /// Ignore `a.b.c.d:port` target overrides in the request path
    #[arg(long)]
    no_path_target: bool,

    /// Port a path override may select (repeatable; default any)
    #[arg(long = "allow-port", value_name = "PORT")]
    allow_ports: Vec<u16>,

    /// `token: host:port` file, or a directory of them, selecting the target by `?token=`
    #[arg(long, value_name = "PATH")]
    token_file: Option<PathBuf>,

    /// Only admit clients sending one of these origins (repeatable)
    #[arg(long = "expect-origin", value_name = "ORIGIN")]
    expect_origins: Vec<String>,

    /// Do not answer Flash socket policy requests
    #[arg(long)]
    no_flash_policy: bool,

    /// Refuse Hixie-75 clients
    #[arg(long)]
    no_hixie75: bool,

    /// Seconds allowed for the upgrade request
    #[arg(long, default_value_t = 3)]
    handshake_timeout: u64,

    /// Seconds allowed to connect to the target
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Bytes queued per direction before reads pause
    #[arg(long, default_value_t = 1024 * 1024)]
    max_queued_bytes: usize,

    /// PEM certificate chain for TLS clients
    #[cfg(feature = "tls-rustls")]
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key for TLS clients
    #[cfg(feature = "tls-rustls")]
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Refuse clients that do not start a TLS handshake
    #[cfg(feature = "tls-rustls")]
    #[arg(long, requires = "cert")]
    tls_only: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn listen_addr(&self) -> String {
        if self.listen.contains(':') {
            self.listen.clone()
        } else {
            format!("0.0.0.0:{}", self.listen)
        }
    }

    fn config(&self) -> Config {
        let defaults = Limits::default();
        let mut config = Config::new()
            .with_limits(Limits::new(
                defaults.max_handshake_size,
                defaults.max_carry_size,
                self.max_queued_bytes,
            ))
            .with_timeouts(Timeouts::new(
                Duration::from_secs(self.handshake_timeout),
                Duration::from_secs(self.connect_timeout),
                Timeouts::default().close,
            ))
            .with_max_connections(self.max_connections)
            .with_header_prefix(self.header_prefix.clone())
            .with_path_target_override(!self.no_path_target)
            .with_flash_policy(!self.no_flash_policy)
            .with_hixie75(!self.no_hixie75);

        if self.require_base64 {
            config = config.with_base64_policy(Base64Policy::Require);
        }
        if !self.allow_ports.is_empty() {
            config = config.with_allowed_target_ports(self.allow_ports.clone());
        }
        config
    }

    fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "wsrelay=info",
            1 => "wsrelay=debug",
            _ => "wsrelay=trace",
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "wsrelay starting");

    let config = cli.config();
    tracing::info!(
        max_connections = config.max_connections,
        base64_policy = ?config.base64_policy,
        path_target_override = config.path_target_override,
        allowed_ports = ?config.allowed_target_ports,
        "configuration loaded"
    );

    let mut manager = ConnectionManager::bind(cli.listen_addr(), cli.target.clone(), config).await?;

    if let Some(ref path) = cli.token_file {
        let tokens = TokenFile::load(path)?;
        tracing::info!(path = %path.display(), "using token file");
        manager = manager.with_tokens(tokens);
    }

    if !cli.expect_origins.is_empty() {
        manager = manager.with_authenticator(ExpectOrigin::new(cli.expect_origins.clone()));
    }

    #[cfg(feature = "tls-rustls")]
    {
        if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
            let acceptor = wsrelay::tls::TlsAcceptor::from_pem_files(cert, key)?.with_tls_only(cli.tls_only);
            tracing::info!(cert = %cert.display(), tls_only = cli.tls_only, "TLS enabled");
            manager = manager.with_tls(acceptor);
        }
    }

    manager.serve(shutdown_signal()).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
