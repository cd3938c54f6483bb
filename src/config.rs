use std::fs::read_to_string;

use anyhow::{Result, ensure};
use clap::Parser;
use serde::Deserialize;

use service::{Address, balancer::Policy};

/// Backend registry file, read once at startup. Later registrations arrive
/// through the discovery listener.
pub const SERVERS_FILE: &str = "servers.json";

#[derive(Deserialize, Debug)]
struct Backend {
    ip: String,
    port: u16,
}

#[derive(Deserialize, Debug)]
struct Backends {
    servers: Vec<Backend>,
}

/// Parse the registry file format, `{"servers":[{"ip":"...","port":N}]}`.
///
/// # Test
///
/// ```
/// use relay_server::config::parse_backends;
///
/// let servers = parse_backends(r#"{"servers":[{"ip":"10.0.0.1","port":8080}]}"#).unwrap();
///
/// assert_eq!(servers.len(), 1);
/// assert_eq!(servers[0].host, "10.0.0.1");
/// assert_eq!(servers[0].port, 8080);
/// ```
pub fn parse_backends(text: &str) -> Result<Vec<Address>> {
    let backends: Backends = serde_json::from_str(text)?;

    Ok(backends
        .servers
        .into_iter()
        .map(|it| Address::new(it.ip, it.port))
        .collect())
}

#[derive(Parser, Debug, Clone)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Config {
    ///
    /// Port the TLS listener binds.
    ///
    #[arg(short, long, default_value_t = 8443)]
    pub port: u16,
    ///
    /// Load balancing policy.
    ///
    /// Valid options: LEAST_CONNECTIONS, RANDOM, IP_HASH, ROUND_ROBIN.
    ///
    #[arg(short, long, default_value_t = Policy::LeastConnections)]
    pub loadbal: Policy,
    ///
    /// Port of the plain-TCP discovery listener. Must differ from the main
    /// port.
    ///
    #[arg(short, long, default_value_t = 49152)]
    pub discovery: u16,
    ///
    /// Consecutive connect failures before a backend is evicted from the
    /// balancer.
    ///
    #[arg(short, long, default_value_t = 3)]
    pub threshold: u32,
    ///
    /// Connect retries per request before the client gets a 502.
    ///
    #[arg(short, long, default_value_t = 5)]
    pub retries: u32,
    ///
    /// Seconds before idle keep-alive connections are timed out.
    ///
    #[arg(short, long, default_value_t = 3)]
    pub keepalive: u64,
    ///
    /// Maximum number of pooled connections per backend.
    ///
    #[arg(short, long, default_value_t = 10)]
    pub maxsize: usize,
    ///
    /// Seconds a pooled connection may sit idle before it is discarded.
    ///
    #[arg(short, long, default_value_t = 10)]
    pub expiration: u64,
    ///
    /// Seconds between connection pool cleanup sweeps.
    ///
    #[arg(short, long, default_value_t = 10)]
    pub frequency: u64,
    ///
    /// Enable verbose logging.
    ///
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    ///
    /// Load and validate the command line parameters. Parse failures and
    /// invalid combinations terminate the process with a nonzero exit code.
    ///
    pub fn load() -> Result<Self> {
        let config = Self::parse();

        ensure!(
            config.port != config.discovery,
            "main and discovery port cannot be the same, currently both {}",
            config.port,
        );

        ensure!(
            config.threshold > 0,
            "failure threshold must be positive, currently {}",
            config.threshold,
        );

        Ok(config)
    }

    pub fn log_level(&self) -> log::Level {
        if self.verbose {
            log::Level::Debug
        } else {
            log::Level::Info
        }
    }

    /// The backends known at startup, from [`SERVERS_FILE`]. A missing or
    /// malformed file leaves the registry empty rather than failing the
    /// boot, discovery can still populate it later.
    pub fn backend_servers(&self) -> Vec<Address> {
        let text = match read_to_string(SERVERS_FILE) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("unable to read backend registry: file={SERVERS_FILE}, err={e}");
                return Vec::new();
            }
        };

        match parse_backends(&text) {
            Ok(servers) => servers,
            Err(e) => {
                log::warn!("invalid backend registry: file={SERVERS_FILE}, err={e}");
                Vec::new()
            }
        }
    }
}
