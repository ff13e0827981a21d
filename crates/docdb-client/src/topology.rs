//! Cluster topology: endpoints, the server-authoritative cluster map, and the
//! node registry that holds the current map.
//!
//! The registry swaps whole maps atomically. Readers take an `Arc` snapshot, so
//! a request that started against an older map keeps a consistent view until it
//! finishes, even if a newer map arrives meanwhile.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::NetworkMode;
use crate::error::{Fault, ProtocolError};

/// Services a node may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Document reads and writes.
    KeyValue,
    /// N1QL-style queries.
    Query,
    /// Full-text search.
    Search,
    /// Analytics queries.
    Analytics,
    /// Map-reduce views.
    Views,
    /// Cluster management API.
    Management,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::KeyValue => "kv",
            Service::Query => "query",
            Service::Search => "search",
            Service::Analytics => "analytics",
            Service::Views => "views",
            Service::Management => "mgmt",
        };
        f.write_str(name)
    }
}

/// An address published for clients outside the node's own network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlternateAddress {
    /// Externally reachable host.
    pub hostname: String,
    /// Externally reachable key-value port.
    pub port: u16,
}

/// One server node as described by the cluster map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP literal on the cluster's internal network.
    pub hostname: String,
    /// Key-value port.
    pub port: u16,
    /// Services this node runs.
    pub services: BTreeSet<Service>,
    /// Address to use under [`NetworkMode::External`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate: Option<AlternateAddress>,
}

impl Endpoint {
    /// An endpoint with no alternate address.
    pub fn new(hostname: impl Into<String>, port: u16, services: &[Service]) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            services: services.iter().copied().collect(),
            alternate: None,
        }
    }

    /// True if the node runs `service`.
    pub fn has_service(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    /// The `host:port` the client dials under the given network mode.
    pub fn address(&self, mode: NetworkMode) -> String {
        let (host, port) = match (mode, &self.alternate) {
            (NetworkMode::External, Some(alt)) => (alt.hostname.as_str(), alt.port),
            _ => (self.hostname.as_str(), self.port),
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }
}

/// The server-authoritative list of nodes, plus key partition ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMap {
    /// Monotonic revision; a map never replaces one with a higher revision.
    pub revision: u64,
    /// Nodes in the order partitions refer to them.
    pub endpoints: Vec<Endpoint>,
    /// `partitions[p]` is the index in `endpoints` of the owner of partition `p`.
    #[serde(default)]
    pub partitions: Vec<u16>,
}

impl ClusterMap {
    /// Parses a map as sent by the server.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Body(format!("cluster map: {e}")))
    }

    /// Serializes the map to its JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Body(format!("cluster map: {e}")))
    }

    /// Addresses of every endpoint under the given network mode.
    pub fn addresses(&self, mode: NetworkMode) -> Vec<String> {
        self.endpoints.iter().map(|e| e.address(mode)).collect()
    }

    /// Endpoint owning the given key.
    ///
    /// With a partition table, the key hashes to a partition whose owner is
    /// looked up. Without one, the key hashes directly over the key-value nodes.
    pub fn endpoint_for_key(&self, key: &str) -> Option<&Endpoint> {
        let hash = key_hash(key) as usize;
        if !self.partitions.is_empty() {
            let partition = hash % self.partitions.len();
            let owner = self.partitions[partition] as usize;
            return self.endpoints.get(owner);
        }
        let kv: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.has_service(Service::KeyValue))
            .collect();
        if kv.is_empty() {
            return None;
        }
        Some(kv[hash % kv.len()])
    }

    /// Endpoints offering the given service, in map order.
    pub fn endpoints_for(&self, service: Service) -> Vec<&Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.has_service(service))
            .collect()
    }
}

/// 15-bit key hash used for partition selection.
pub fn key_hash(key: &str) -> u32 {
    (crc32fast::hash(key.as_bytes()) >> 16) & 0x7fff
}

/// Outcome of offering a map to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapUpdate {
    /// The map was newer and replaced the current one.
    Applied {
        /// Revision now in effect.
        revision: u64,
        /// Node addresses that joined.
        added: Vec<String>,
        /// Node addresses that left.
        removed: Vec<String>,
    },
    /// Same revision as the current map; nothing changed.
    Unchanged,
    /// Older than the current map; discarded.
    Stale {
        /// Revision kept.
        current: u64,
        /// Revision that was discarded.
        offered: u64,
    },
}

/// Tracks the live node set, refreshed from server-delivered cluster maps.
pub struct NodeRegistry {
    map: RwLock<Arc<ClusterMap>>,
    mode: NetworkMode,
    cursor: AtomicUsize,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("revision", &self.revision())
            .field("mode", &self.mode)
            .finish()
    }
}

impl NodeRegistry {
    /// Creates a registry seeded with the map fetched during bootstrap.
    pub fn new(map: ClusterMap, mode: NetworkMode) -> Self {
        Self {
            map: RwLock::new(Arc::new(map)),
            mode,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Which endpoint address is dialled.
    pub fn network_mode(&self) -> NetworkMode {
        self.mode
    }

    /// The current map. The snapshot stays valid after later updates.
    pub fn snapshot(&self) -> Arc<ClusterMap> {
        match self.map.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Revision of the current map.
    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    /// Addresses of every node in the current map.
    pub fn addresses(&self) -> Vec<String> {
        self.snapshot().addresses(self.mode)
    }

    /// Offers a new map. Lower revisions are ignored without error.
    pub fn apply(&self, map: ClusterMap) -> MapUpdate {
        let mut guard = match self.map.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = guard.revision;
        if map.revision < current {
            debug!(current, offered = map.revision, "ignoring stale cluster map");
            return MapUpdate::Stale {
                current,
                offered: map.revision,
            };
        }
        if map.revision == current {
            return MapUpdate::Unchanged;
        }

        let old: BTreeSet<String> = guard.addresses(self.mode).into_iter().collect();
        let new: BTreeSet<String> = map.addresses(self.mode).into_iter().collect();
        let added: Vec<String> = new.difference(&old).cloned().collect();
        let removed: Vec<String> = old.difference(&new).cloned().collect();
        let revision = map.revision;
        *guard = Arc::new(map);

        info!(
            revision,
            added = added.len(),
            removed = removed.len(),
            "cluster map updated"
        );
        MapUpdate::Applied {
            revision,
            added,
            removed,
        }
    }

    /// Address of the node owning `key`.
    pub fn node_for_key(&self, key: &str) -> Result<String, Fault> {
        let map = self.snapshot();
        map.endpoint_for_key(key)
            .map(|e| e.address(self.mode))
            .ok_or_else(|| Fault::no_available_node(format!("no key-value node owns key {key:?}")))
    }

    /// Address of a node running `service`, rotating across candidates.
    pub fn node_for_service(&self, service: Service) -> Result<String, Fault> {
        let map = self.snapshot();
        let candidates = map.endpoints_for(service);
        if candidates.is_empty() {
            return Err(Fault::no_available_node(format!(
                "no node in cluster map revision {} runs the {service} service",
                map.revision
            )));
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[i].address(self.mode))
    }
}
