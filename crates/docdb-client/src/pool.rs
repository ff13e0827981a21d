//! Per-node connection pool.
//!
//! Each node gets a slot holding idle connections, the connections currently
//! in use, and a semaphore with `max_per_node` permits. A connection holds one
//! permit while it is in use or being dialled, so a node never has more than
//! `max_per_node` connections open. In-use connections are either exclusive
//! (a query stream owns the whole connection) or shared by up to
//! `max_requests_per_connection` requests multiplexed over it. A connection
//! goes back to the idle set when its last [`Lease`] drops, unless it is
//! draining or closed, in which case it is discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionId, ManagedConnection};
use crate::error::Fault;
use crate::metrics::ClientMetrics;

/// Opens ready-to-use connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dials, handshakes and authenticates a new connection to `node`.
    async fn connect(&self, node: &str) -> Result<Arc<ManagedConnection>, Fault>;
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Nodes with a pool slot.
    pub nodes: usize,
    /// Idle connections across all nodes.
    pub idle: usize,
    /// Connections in use across all nodes.
    pub leased: usize,
    /// Leases held across all nodes; above `leased` when requests share connections.
    pub requests: usize,
}

struct IdleEntry {
    conn: Arc<ManagedConnection>,
    since: Instant,
}

struct ActiveConn {
    conn: Arc<ManagedConnection>,
    users: usize,
    shared: bool,
    _permit: OwnedSemaphorePermit,
}

struct NodeSlot {
    node: String,
    max: usize,
    per_connection: usize,
    idle_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
    active: Mutex<HashMap<ConnectionId, ActiveConn>>,
    dialing: AtomicUsize,
    freed: Notify,
    draining: AtomicBool,
}

/// Counts one dial in progress for as long as it lives.
struct Dialing<'a>(&'a AtomicUsize);

impl<'a> Dialing<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Dialing<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Grant {
    Joined(Arc<ManagedConnection>),
    Permit(OwnedSemaphorePermit),
}

impl NodeSlot {
    fn new(node: &str, config: &PoolConfig) -> Self {
        Self {
            node: node.to_string(),
            max: config.max_per_node,
            per_connection: config.max_requests_per_connection.max(1),
            idle_timeout: config.idle_timeout(),
            permits: Arc::new(Semaphore::new(config.max_per_node)),
            idle: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashMap::new()),
            dialing: AtomicUsize::new(0),
            freed: Notify::new(),
            draining: AtomicBool::new(false),
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleEntry>> {
        self.idle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ActiveConn>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn outstanding(&self) -> usize {
        self.active().len()
    }

    /// Most recently returned usable connection; stale ones are closed on the way.
    fn take_idle(&self) -> Option<Arc<ManagedConnection>> {
        let mut idle = self.idle();
        while let Some(entry) = idle.pop_back() {
            if entry.conn.is_ready() && entry.since.elapsed() < self.idle_timeout {
                return Some(entry.conn);
            }
            entry.conn.close();
        }
        None
    }

    /// Joins the least loaded shared connection that still has room.
    fn try_share(&self) -> Option<Arc<ManagedConnection>> {
        let mut active = self.active();
        let entry = active
            .values_mut()
            .filter(|e| {
                e.shared && e.users < self.per_connection && e.conn.is_ready() && !e.conn.has_stream()
            })
            .min_by_key(|e| e.users)?;
        entry.users += 1;
        Some(entry.conn.clone())
    }

    fn activate(&self, conn: Arc<ManagedConnection>, shared: bool, permit: OwnedSemaphorePermit) {
        self.active().insert(
            conn.id(),
            ActiveConn {
                conn,
                users: 1,
                shared,
                _permit: permit,
            },
        );
        if shared {
            // Requests waiting for a permit may join this connection instead.
            self.freed.notify_waiters();
        }
    }

    fn release(&self, conn: &Arc<ManagedConnection>) {
        let mut active = self.active();
        let Some(entry) = active.get_mut(&conn.id()) else {
            return;
        };
        entry.users -= 1;
        if entry.users > 0 {
            drop(active);
            self.freed.notify_waiters();
            return;
        }
        let entry = active.remove(&conn.id());
        drop(active);

        if conn.is_ready() && !self.is_draining() && !conn.has_stream() {
            self.idle().push_back(IdleEntry {
                conn: conn.clone(),
                since: Instant::now(),
            });
        } else {
            debug!(conn_id = conn.id(), node = %self.node, state = ?conn.state(), "discarding released connection");
            conn.close();
        }
        // The permit goes back only after the connection is idle again.
        drop(entry);
        self.freed.notify_waiters();
    }

    fn reap(&self) -> usize {
        let mut idle = self.idle();
        let before = idle.len();
        idle.retain(|entry| {
            let keep = entry.conn.is_ready() && entry.since.elapsed() < self.idle_timeout;
            if !keep {
                entry.conn.close();
            }
            keep
        });
        before - idle.len()
    }

    fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.permits.close();
        for entry in self.idle().drain(..) {
            entry.conn.close();
        }
        for entry in self.active().values() {
            // Nobody may read a stream's remaining rows any more.
            if entry.conn.has_stream() {
                entry.conn.close();
            } else {
                entry.conn.mark_draining();
            }
        }
    }
}

/// An acquired connection. Dropping the lease releases it to the pool.
pub struct Lease {
    conn: Arc<ManagedConnection>,
    slot: Arc<NodeSlot>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("conn", &self.conn).finish()
    }
}

impl Lease {
    /// The leased connection.
    pub fn connection(&self) -> &Arc<ManagedConnection> {
        &self.conn
    }

    /// Address of the node the connection belongs to.
    pub fn node(&self) -> &str {
        &self.slot.node
    }

    /// Closes the connection instead of returning it to the idle set.
    ///
    /// Only meaningful for exclusive leases; requests sharing the connection
    /// fail with `ConnectionLost`.
    pub fn discard(self) {
        self.conn.close();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.slot.release(&self.conn);
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    nodes: RwLock<HashMap<String, Arc<NodeSlot>>>,
    metrics: Arc<ClientMetrics>,
}

/// Connection pool shared by every session of one cluster.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// An empty pool; nodes are added with `add_node` or `sync_nodes`.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                nodes: RwLock::new(HashMap::new()),
                metrics,
            }),
        }
    }

    /// Bounds the pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn slot(&self, node: &str) -> Option<Arc<NodeSlot>> {
        self.inner
            .nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(node)
            .cloned()
    }

    /// Registers a node. Returns false if it already had a slot.
    pub fn add_node(&self, node: &str) -> bool {
        let mut nodes = self.inner.nodes.write().unwrap_or_else(|p| p.into_inner());
        if nodes.contains_key(node) {
            return false;
        }
        nodes.insert(node.to_string(), Arc::new(NodeSlot::new(node, &self.inner.config)));
        debug!(node = node, "pool slot added");
        true
    }

    /// True if `node` currently has a slot.
    pub fn contains(&self, node: &str) -> bool {
        self.slot(node).is_some()
    }

    /// Nodes currently in the pool, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .inner
            .nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        nodes.sort();
        nodes
    }

    /// Acquires a connection to `node` for exclusive use.
    ///
    /// Reuses an idle connection when one is available and opens a new one
    /// otherwise. Waits for a free permit until `deadline`, then fails with
    /// [`crate::error::FaultKind::PoolExhausted`].
    pub async fn acquire(&self, node: &str, deadline: Instant) -> Result<Lease, Fault> {
        self.acquire_as(node, deadline, false).await
    }

    /// Acquires a connection to `node` that other requests may share.
    ///
    /// Joins an in-use connection carrying fewer than
    /// `max_requests_per_connection` requests before opening another one.
    pub async fn acquire_shared(&self, node: &str, deadline: Instant) -> Result<Lease, Fault> {
        self.acquire_as(node, deadline, true).await
    }

    async fn acquire_as(&self, node: &str, deadline: Instant, shared: bool) -> Result<Lease, Fault> {
        let slot = self
            .slot(node)
            .ok_or_else(|| Fault::no_available_node(format!("node {node} is not in the cluster map")))?;
        if slot.is_draining() {
            return Err(Fault::no_available_node(format!("node {node} is draining")));
        }

        let waiting = slot.clone();
        let wait = async move {
            loop {
                let freed = waiting.freed.notified();
                tokio::pin!(freed);
                freed.as_mut().enable();
                if shared {
                    if let Some(conn) = waiting.try_share() {
                        return Ok(Grant::Joined(conn));
                    }
                }
                tokio::select! {
                    permit = waiting.permits.clone().acquire_owned() => return permit.map(Grant::Permit),
                    _ = &mut freed, if shared => continue,
                }
            }
        };
        let permit = match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(Grant::Joined(conn))) => {
                return Ok(Lease { conn, slot });
            }
            Ok(Ok(Grant::Permit(permit))) => permit,
            Ok(Err(_)) => {
                return Err(Fault::no_available_node(format!("node {node} left the cluster map")))
            }
            Err(_) => {
                self.inner.metrics.inc_pool_exhausted();
                debug!(node = node, max = slot.max, "pool exhausted");
                return Err(Fault::pool_exhausted(format!(
                    "all {} connections to {node} stayed busy until the deadline",
                    slot.max
                )));
            }
        };

        let conn = match slot.take_idle() {
            Some(conn) => conn,
            None => {
                let _dialing = Dialing::start(&slot.dialing);
                match tokio::time::timeout_at(deadline, self.inner.connector.connect(node)).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(fault)) => return Err(fault),
                    Err(_) => {
                        return Err(Fault::timeout(format!(
                            "connecting to {node} did not finish before the deadline"
                        )))
                    }
                }
            }
        };

        if slot.is_draining() {
            conn.close();
            return Err(Fault::no_available_node(format!("node {node} is draining")));
        }
        slot.activate(conn.clone(), shared, permit);
        Ok(Lease { conn, slot })
    }

    /// Number of connections to `node` currently in use.
    pub fn outstanding(&self, node: &str) -> usize {
        self.slot(node).map_or(0, |slot| slot.outstanding())
    }

    /// Opens connections until `node` has at least `min_per_node`.
    ///
    /// Connections already in use or being dialled count toward the minimum,
    /// and every dial holds a permit, so warming never pushes a node past
    /// `max_per_node`.
    pub async fn warm(&self, node: &str) -> Result<usize, Fault> {
        let Some(slot) = self.slot(node) else {
            return Ok(0);
        };
        let mut opened = 0;
        loop {
            let have = slot.idle().len() + slot.active().len() + slot.dialing.load(Ordering::SeqCst);
            if have >= self.inner.config.min_per_node || slot.is_draining() {
                break;
            }
            let Ok(_permit) = slot.permits.clone().try_acquire_owned() else {
                break;
            };
            let conn = {
                let _dialing = Dialing::start(&slot.dialing);
                self.inner.connector.connect(node).await?
            };
            if slot.is_draining() {
                conn.close();
                break;
            }
            slot.idle().push_back(IdleEntry {
                conn,
                since: Instant::now(),
            });
            slot.freed.notify_waiters();
            opened += 1;
        }
        if opened > 0 {
            debug!(node = node, opened, "pool warmed");
        }
        Ok(opened)
    }

    /// Stops handing out connections to `node` and removes its slot.
    ///
    /// Idle connections close immediately. In-use ones are marked draining,
    /// finish their in-flight requests and close when released; a connection
    /// carrying a query stream closes at once.
    pub fn drain_node(&self, node: &str) -> bool {
        let slot = self
            .inner
            .nodes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(node);
        match slot {
            Some(slot) => {
                let leased = slot.active().len();
                slot.drain();
                info!(node = node, leased, "draining node");
                true
            }
            None => false,
        }
    }

    /// Adds slots for new nodes and drains nodes no longer listed.
    pub fn sync_nodes(&self, nodes: &[String]) -> (Vec<String>, Vec<String>) {
        let added: Vec<String> = nodes
            .iter()
            .filter(|node| self.add_node(node))
            .cloned()
            .collect();
        let removed: Vec<String> = self
            .nodes()
            .into_iter()
            .filter(|node| !nodes.contains(node))
            .collect();
        for node in &removed {
            self.drain_node(node);
        }
        (added, removed)
    }

    /// Closes idle connections older than the idle timeout.
    pub fn reap_idle(&self) -> usize {
        let slots: Vec<Arc<NodeSlot>> = self
            .inner
            .nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let reaped: usize = slots.iter().map(|slot| slot.reap()).sum();
        if reaped > 0 {
            debug!(reaped, "closed idle connections");
        }
        reaped
    }

    /// Drains every node.
    pub fn shutdown(&self) {
        let leased = self.stats().leased;
        if leased > 0 {
            warn!(leased, "pool shutting down with acquired connections");
        }
        for node in self.nodes() {
            self.drain_node(&node);
        }
    }

    /// Counts of idle, leased and in-flight work across every node.
    pub fn stats(&self) -> PoolStats {
        let nodes = self.inner.nodes.read().unwrap_or_else(|p| p.into_inner());
        PoolStats {
            nodes: nodes.len(),
            idle: nodes.values().map(|s| s.idle().len()).sum(),
            leased: nodes.values().map(|s| s.active().len()).sum(),
            requests: nodes
                .values()
                .map(|s| s.active().values().map(|e| e.users).sum::<usize>())
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::transport::FramedConnection;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct FakeConnector {
        next_id: AtomicU64,
        fail: AtomicBool,
        dial_ms: AtomicU64,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, node: &str) -> Result<Arc<ManagedConnection>, Fault> {
            let dial_ms = self.dial_ms.load(Ordering::SeqCst);
            if dial_ms > 0 {
                tokio::time::sleep(Duration::from_millis(dial_ms)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Fault::connection_lost(format!("{node} refused")));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let (a, _b) = tokio::io::duplex(64);
            let conn = ManagedConnection::new(id, node, Box::new(FramedConnection::new(a, node)));
            conn.mark_ready();
            Ok(Arc::new(conn))
        }
    }

    fn pool(max: usize, connector: Arc<FakeConnector>) -> ConnectionPool {
        let config = PoolConfig {
            min_per_node: 0,
            max_per_node: max,
            max_requests_per_connection: 2,
            idle_timeout_ms: 1_000,
        };
        let pool = ConnectionPool::new(config, connector, Arc::new(ClientMetrics::new()));
        pool.add_node("a:1");
        pool
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reuses_released_connection() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool(2, connector.clone());

        let lease = pool.acquire("a:1", soon()).await.unwrap();
        let first_id = lease.connection().id();
        assert_eq!(pool.outstanding("a:1"), 1);
        drop(lease);
        assert_eq!(pool.outstanding("a:1"), 0);
        assert_eq!(pool.stats().idle, 1);

        let lease = pool.acquire("a:1", soon()).await.unwrap();
        assert_eq!(lease.connection().id(), first_id);
        assert_eq!(connector.next_id.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_until_deadline() {
        let pool = pool(1, Arc::new(FakeConnector::default()));
        let _held = pool.acquire("a:1", soon()).await.unwrap();

        let err = pool.acquire("a:1", soon()).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::PoolExhausted);
        assert_eq!(pool.inner.metrics.snapshot().pool_exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_connection_on_release() {
        let pool = pool(1, Arc::new(FakeConnector::default()));
        let held = pool.acquire("a:1", soon()).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire("a:1", Instant::now() + Duration::from_secs(5))
                    .await
                    .map(|l| l.connection().id())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let held_id = held.connection().id();
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_node() {
        let pool = pool(1, Arc::new(FakeConnector::default()));
        let err = pool.acquire("zzz:1", soon()).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::NoAvailableNode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_releases_permit() {
        let connector = Arc::new(FakeConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let pool = pool(1, connector.clone());

        let err = pool.acquire("a:1", soon()).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::ConnectionLost);
        assert_eq!(pool.outstanding("a:1"), 0);

        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire("a:1", soon()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_is_discarded_on_release() {
        let pool = pool(2, Arc::new(FakeConnector::default()));
        let lease = pool.acquire("a:1", soon()).await.unwrap();
        let conn = lease.connection().clone();
        conn.close();
        drop(lease);
        assert_eq!(pool.stats().idle, 0);

        let lease = pool.acquire("a:1", soon()).await.unwrap();
        assert_ne!(lease.connection().id(), conn.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_node_lets_leases_finish() {
        let pool = pool(2, Arc::new(FakeConnector::default()));
        let idle = pool.acquire("a:1", soon()).await.unwrap();
        let idle_conn = idle.connection().clone();
        drop(idle);
        let busy = pool.acquire("a:1", soon()).await.unwrap();
        let busy_conn = busy.connection().clone();
        assert_eq!(busy_conn.id(), idle_conn.id());
        let second = pool.acquire("a:1", soon()).await.unwrap();
        drop(second);

        assert!(pool.drain_node("a:1"));
        assert!(!pool.contains("a:1"));
        assert_eq!(busy_conn.state(), crate::connection::ConnectionState::Draining);

        let err = pool.acquire("a:1", soon()).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::NoAvailableNode);

        drop(busy);
        assert_eq!(busy_conn.state(), crate::connection::ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_closes_expired() {
        let pool = pool(2, Arc::new(FakeConnector::default()));
        let lease = pool.acquire("a:1", soon()).await.unwrap();
        let conn = lease.connection().clone();
        drop(lease);

        assert_eq!(pool.reap_idle(), 0);
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert!(!conn.is_ready());
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_opens_min_connections() {
        let connector = Arc::new(FakeConnector::default());
        let config = PoolConfig {
            min_per_node: 2,
            max_per_node: 4,
            max_requests_per_connection: 2,
            idle_timeout_ms: 1_000,
        };
        let pool = ConnectionPool::new(config, connector, Arc::new(ClientMetrics::new()));
        pool.add_node("a:1");
        assert_eq!(pool.warm("a:1").await.unwrap(), 2);
        assert_eq!(pool.warm("a:1").await.unwrap(), 0);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_nodes() {
        let pool = pool(1, Arc::new(FakeConnector::default()));
        let (added, removed) = pool.sync_nodes(&["b:1".to_string(), "c:1".to_string()]);
        assert_eq!(added, vec!["b:1".to_string(), "c:1".to_string()]);
        assert_eq!(removed, vec!["a:1".to_string()]);
        assert_eq!(pool.nodes(), vec!["b:1".to_string(), "c:1".to_string()]);

        pool.shutdown();
        assert_eq!(pool.stats().nodes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_leases_multiplex_up_to_cap() {
        let connector = Arc::new(FakeConnector::default());
        let pool = pool(2, connector.clone());

        let a = pool.acquire_shared("a:1", soon()).await.unwrap();
        let b = pool.acquire_shared("a:1", soon()).await.unwrap();
        assert_eq!(a.connection().id(), b.connection().id());
        assert_eq!(pool.outstanding("a:1"), 1);

        // Two requests per connection: the third opens a second connection.
        let c = pool.acquire_shared("a:1", soon()).await.unwrap();
        assert_ne!(c.connection().id(), a.connection().id());
        let stats = pool.stats();
        assert_eq!((stats.leased, stats.requests), (2, 3));

        drop(a);
        assert_eq!(pool.outstanding("a:1"), 2);
        drop(b);
        assert_eq!(pool.outstanding("a:1"), 1);
        assert_eq!(pool.stats().idle, 1);
        drop(c);
        assert_eq!(connector.next_id.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_lease_is_never_shared() {
        let pool = pool(1, Arc::new(FakeConnector::default()));
        let _stream = pool.acquire("a:1", soon()).await.unwrap();
        let err = pool.acquire_shared("a:1", soon()).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::PoolExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_waiter_joins_when_a_request_finishes() {
        let pool = pool(1, Arc::new(FakeConnector::default()));
        let first = pool.acquire_shared("a:1", soon()).await.unwrap();
        let second = pool.acquire_shared("a:1", soon()).await.unwrap();
        let conn_id = first.connection().id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_shared("a:1", Instant::now() + Duration::from_secs(5))
                    .await
                    .map(|l| l.connection().id())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);
        assert_eq!(waiter.await.unwrap().unwrap(), conn_id);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_counts_dials_in_progress() {
        let connector = Arc::new(FakeConnector::default());
        connector.dial_ms.store(100, Ordering::SeqCst);
        let config = PoolConfig {
            min_per_node: 2,
            max_per_node: 2,
            max_requests_per_connection: 1,
            idle_timeout_ms: 60_000,
        };
        let pool = ConnectionPool::new(config, connector.clone(), Arc::new(ClientMetrics::new()));
        pool.add_node("a:1");

        let acquiring = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("a:1", Instant::now() + Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.warm("a:1").await.unwrap(), 1);
        let lease = acquiring.await.unwrap().unwrap();
        assert_eq!(connector.next_id.load(Ordering::SeqCst), 2);
        let stats = pool.stats();
        assert_eq!(stats.idle + stats.leased, 2);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_closes_connection_carrying_stream() {
        let pool = pool(2, Arc::new(FakeConnector::default()));
        let streaming = pool.acquire("a:1", soon()).await.unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        assert!(streaming.connection().open_stream(7, tx));
        let plain = pool.acquire("a:1", soon()).await.unwrap();

        pool.shutdown();
        assert_eq!(streaming.connection().state(), crate::connection::ConnectionState::Closed);
        assert_eq!(plain.connection().state(), crate::connection::ConnectionState::Draining);
    }

    proptest! {
        #[test]
        fn prop_outstanding_never_exceeds_max(
            max in 1usize..5,
            ops in proptest::collection::vec(any::<bool>(), 1..60),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let peak = rt.block_on(async move {
                let pool = pool(max, Arc::new(FakeConnector::default()));
                let mut held = VecDeque::new();
                let mut peak = 0;
                for acquire in ops {
                    if acquire {
                        match pool.acquire("a:1", Instant::now() + Duration::from_millis(5)).await {
                            Ok(lease) => held.push_back(lease),
                            Err(fault) => assert_eq!(fault.kind, FaultKind::PoolExhausted),
                        }
                    } else {
                        held.pop_front();
                    }
                    peak = peak.max(pool.outstanding("a:1"));
                    assert_eq!(pool.outstanding("a:1"), held.len());
                }
                peak
            });
            prop_assert!(peak <= max);
        }
    }
}
