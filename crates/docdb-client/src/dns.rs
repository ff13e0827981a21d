//! Seed discovery through DNS SRV records.
//!
//! When [`ClientConfig::dns_srv`] names a record such as
//! `_docdb._tcp.db.example.com`, its targets become bootstrap seeds ahead of
//! any explicitly configured ones. Records are ordered by ascending priority,
//! then descending weight, then target name, so the seed order is stable for a
//! given answer.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// One answer of an SRV lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    /// Lower is preferred.
    pub priority: u16,
    /// Relative preference among records of equal priority; higher is preferred.
    pub weight: u16,
    /// Port the target serves on.
    pub port: u16,
    /// Host name of the target, with or without the trailing root dot.
    pub target: String,
}

/// Answers SRV queries.
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Looks up the SRV records published under `name`.
    async fn query_srv(&self, name: &str) -> std::result::Result<Vec<SrvRecord>, String>;
}

/// [`DnsClient`] backed by the system resolver configuration.
pub struct HickoryDnsClient {
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for HickoryDnsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryDnsClient").finish()
    }
}

impl HickoryDnsClient {
    /// Builds a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            ClientError::InvalidConfig {
                reason: format!("cannot load the system DNS configuration: {e}"),
            }
        })?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl DnsClient for HickoryDnsClient {
    async fn query_srv(&self, name: &str) -> std::result::Result<Vec<SrvRecord>, String> {
        let lookup = self.resolver.srv_lookup(name).await.map_err(|e| e.to_string())?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect())
    }
}

/// Turns SRV answers into `host:port` seeds in preference order.
pub fn srv_seeds(mut records: Vec<SrvRecord>) -> Vec<String> {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
            .then_with(|| a.target.cmp(&b.target))
    });
    let mut seeds: Vec<String> = Vec::with_capacity(records.len());
    for record in records {
        let host = record.target.trim_end_matches('.');
        if host.is_empty() || record.port == 0 {
            debug!(target = %record.target, port = record.port, "skipping unusable SRV record");
            continue;
        }
        let seed = if host.contains(':') {
            format!("[{host}]:{}", record.port)
        } else {
            format!("{host}:{}", record.port)
        };
        if !seeds.contains(&seed) {
            seeds.push(seed);
        }
    }
    seeds
}

/// The ordered seed list for bootstrap.
///
/// Without `dns_srv` these are the configured seeds. With it, the SRV targets
/// come first and configured seeds follow. A failed or empty lookup falls back
/// to the configured seeds and is an error only if there are none.
pub async fn resolve_seeds(config: &ClientConfig, dns: &dyn DnsClient) -> Result<Vec<String>> {
    let configured = config.seed_addresses()?;
    let Some(name) = config.dns_srv.as_deref() else {
        return Ok(configured);
    };

    let failure = match dns.query_srv(name).await {
        Ok(records) => {
            let mut seeds = srv_seeds(records);
            if !seeds.is_empty() {
                debug!(record = name, discovered = seeds.len(), "seeds resolved from DNS");
                for seed in configured {
                    if !seeds.contains(&seed) {
                        seeds.push(seed);
                    }
                }
                return Ok(seeds);
            }
            "no usable SRV records".to_string()
        }
        Err(reason) => reason,
    };

    if configured.is_empty() {
        return Err(ClientError::SeedResolution {
            name: name.to_string(),
            reason: failure,
        });
    }
    warn!(record = name, reason = %failure, "DNS seed lookup failed, using configured seeds");
    Ok(configured)
}
