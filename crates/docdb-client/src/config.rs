//! Client configuration.
//!
//! Plain structs, constructed once and checked by [`ClientConfig::validate`]
//! when a cluster or session is opened. Loading them from files is left to the
//! embedding application; every struct is serde-derivable for that purpose.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ClientError, Result};
use crate::topology::Service;

/// Default key-value port for plain connections.
pub const DEFAULT_KV_PORT: u16 = 11210;

/// Default key-value port for TLS connections.
pub const DEFAULT_KV_TLS_PORT: u16 = 11207;

/// Username and password presented on every connection.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Secret; zeroed on drop and redacted from `Debug`.
    pub password: String,
}

impl Credentials {
    /// Pairs a username with its password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-service operation timeouts in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTimeouts {
    /// Key-value operations.
    pub kv_ms: u64,
    /// Query execution, header through the last row.
    pub query_ms: u64,
    /// Full-text search requests.
    pub search_ms: u64,
    /// Analytics requests.
    pub analytics_ms: u64,
    /// Cluster management calls.
    pub management_ms: u64,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            kv_ms: 2_500,
            query_ms: 75_000,
            search_ms: 75_000,
            analytics_ms: 75_000,
            management_ms: 75_000,
        }
    }
}

impl ServiceTimeouts {
    /// Default timeout for an operation against the given service.
    pub fn for_service(&self, service: Service) -> Duration {
        let ms = match service {
            Service::KeyValue => self.kv_ms,
            Service::Query => self.query_ms,
            Service::Search => self.search_ms,
            Service::Analytics => self.analytics_ms,
            Service::Views | Service::Management => self.management_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly per node when the node joins the map.
    pub min_per_node: usize,
    /// Upper bound on open connections per node.
    pub max_per_node: usize,
    /// Requests multiplexed over one connection before another is opened.
    pub max_requests_per_connection: usize,
    /// Idle connections older than this are closed.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_per_node: 1,
            max_per_node: 4,
            max_requests_per_connection: 16,
            idle_timeout_ms: 300_000,
        }
    }
}

impl PoolConfig {
    /// `idle_timeout_ms` as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Dial nodes with TLS on the TLS port.
    pub enabled: bool,
    /// PEM-encoded CA certificate(s) used to verify the servers.
    pub ca_cert_pem: Option<String>,
    /// Name to verify in the server certificate; defaults to the endpoint host.
    pub server_name: Option<String>,
}

/// Which addresses of a node the client dials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// The addresses the nodes report for themselves.
    #[default]
    Default,
    /// The alternate (NAT-mapped) addresses, when a node publishes one.
    External,
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bootstrap candidates as `host` or `host:port`, tried in order.
    pub seeds: Vec<String>,
    /// SRV record whose targets are tried ahead of `seeds`, e.g.
    /// `_docdb._tcp.db.example.com`.
    pub dns_srv: Option<String>,
    /// Presented on every new connection.
    pub credentials: Credentials,
    /// Bucket opened by [`crate::session::Session::open`].
    pub bucket: String,
    /// Name announced in the `Hello` handshake.
    pub client_name: String,
    /// Per-service operation timeouts.
    pub timeouts: ServiceTimeouts,
    /// Connection pool bounds.
    pub pool: PoolConfig,
    /// TLS is off unless `tls.enabled` is set.
    pub tls: TlsSettings,
    /// Which address of each endpoint to dial.
    pub network: NetworkMode,
    /// Timeout for establishing and authenticating one connection.
    pub connect_timeout_ms: u64,
    /// How long `close()` waits for in-flight operations before failing them.
    pub close_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["localhost".to_string()],
            dns_srv: None,
            credentials: Credentials::default(),
            bucket: "default".to_string(),
            client_name: format!("docdb-client/{}", env!("CARGO_PKG_VERSION")),
            timeouts: ServiceTimeouts::default(),
            pool: PoolConfig::default(),
            tls: TlsSettings::default(),
            network: NetworkMode::Default,
            connect_timeout_ms: 10_000,
            close_grace_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given seeds, credentials and bucket.
    pub fn new(
        seeds: Vec<String>,
        credentials: Credentials,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            seeds,
            credentials,
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// `connect_timeout_ms` as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `close_grace_ms` as a `Duration`.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Port used for seeds that do not name one.
    pub fn default_port(&self) -> u16 {
        if self.tls.enabled {
            DEFAULT_KV_TLS_PORT
        } else {
            DEFAULT_KV_PORT
        }
    }

    /// Seeds normalised to `host:port`, in configured order.
    pub fn seed_addresses(&self) -> Result<Vec<String>> {
        self.seeds
            .iter()
            .map(|seed| normalize_seed(seed, self.default_port()))
            .collect()
    }

    /// Checks the configuration before any connection is attempted.
    pub fn validate(&self) -> Result<()> {
        match self.dns_srv.as_deref() {
            Some(name) if name.trim().is_empty() => {
                return Err(invalid("dns_srv record name cannot be empty"));
            }
            None if self.seeds.is_empty() => {
                return Err(invalid("at least one seed or a dns_srv record must be configured"));
            }
            _ => {}
        }
        self.seed_addresses()?;

        if self.bucket.is_empty() {
            return Err(invalid("bucket name cannot be empty"));
        }

        if self.pool.max_per_node == 0 {
            return Err(invalid("pool max_per_node must be at least 1"));
        }
        if self.pool.max_requests_per_connection == 0 {
            return Err(invalid("pool max_requests_per_connection must be at least 1"));
        }
        if self.pool.min_per_node > self.pool.max_per_node {
            return Err(invalid(format!(
                "pool min_per_node ({}) exceeds max_per_node ({})",
                self.pool.min_per_node, self.pool.max_per_node
            )));
        }

        let t = &self.timeouts;
        if [t.kv_ms, t.query_ms, t.search_ms, t.analytics_ms, t.management_ms]
            .iter()
            .any(|ms| *ms == 0)
        {
            return Err(invalid("service timeouts must be non-zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be non-zero"));
        }

        if self.tls.enabled && self.tls.ca_cert_pem.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("TLS enabled but no CA certificate configured"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ClientError {
    ClientError::InvalidConfig {
        reason: reason.into(),
    }
}

/// Turns `host`, `host:port`, `[v6]` or `[v6]:port` into `host:port`.
pub fn normalize_seed(seed: &str, default_port: u16) -> Result<String> {
    let seed = seed.trim();
    if seed.is_empty() {
        return Err(invalid("seed cannot be empty"));
    }

    if let Some(rest) = seed.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(format!("unterminated IPv6 seed: {seed}")))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok(format!("[{host}]:{}", parse_port(seed, port)?)),
            None if tail.is_empty() => Ok(format!("[{host}]:{default_port}")),
            None => Err(invalid(format!("malformed seed: {seed}"))),
        };
    }

    match seed.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(invalid(format!("seed has no host: {seed}")));
            }
            Ok(format!("{host}:{}", parse_port(seed, port)?))
        }
        Some(_) => Err(invalid(format!(
            "IPv6 seeds must be bracketed: {seed}"
        ))),
        None => Ok(format!("{seed}:{default_port}")),
    }
}

fn parse_port(seed: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(invalid(format!("invalid port in seed: {seed}"))),
    }
}
