//! Cluster and bucket sessions.
//!
//! A [`Cluster`] is the caller-owned object holding everything shared between
//! buckets: the node registry, the connection pool and the dispatcher. A
//! [`Session`] is a handle to one bucket on top of a cluster. Sessions created
//! with [`Cluster::bucket`] share the cluster's pool; [`Session::open`] creates
//! a private cluster that the session shuts down when it closes.
//!
//! Session lifecycle: `Opening -> Open -> Closing -> Closed`. Operations issued
//! while the session is opening wait for the outcome. Operations issued once it
//! is closing or closed resolve immediately with a `SessionClosed` fault.
//! `close()` lets in-flight operations finish until the grace period ends and
//! then fails the rest with `Timeout`; it returns once every one has resolved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::Bootstrapper;
use crate::dns::{resolve_seeds, HickoryDnsClient};
use crate::config::{ClientConfig, ServiceTimeouts};
use crate::dispatcher::{Dispatcher, HandshakeConnector, Multiplexer, PUSH_CHANNEL_CAPACITY};
use crate::error::{ClientError, Fault, Result};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::ops::{Document, Exists, Get, Mutation, Operation};
use crate::pool::{ConnectionPool, PoolStats};
use crate::protocol::{Frame, Opcode};
use crate::query::{self, QueryRequest, QueryResult};
use crate::result::OpResult;
use crate::tcp::{TcpTransport, TcpTransportConfig};
use crate::tls::TlsTcpTransport;
use crate::topology::{ClusterMap, MapUpdate, NodeRegistry, Service};
use crate::transport::Transport;

/// How often the topology task closes expired idle connections.
const REAP_INTERVAL: Duration = Duration::from_secs(10);

struct ClusterInner {
    config: ClientConfig,
    registry: Arc<NodeRegistry>,
    dispatcher: Dispatcher,
    metrics: Arc<ClientMetrics>,
    shutdown: CancellationToken,
    seed: String,
    server_version: String,
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.dispatcher.pool().shutdown();
    }
}

/// Connection to one cluster, shared by every bucket session opened on it.
///
/// Cheap to clone. The pool shuts down when [`Cluster::shutdown`] is called or
/// the last clone is dropped.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("seed", &self.inner.seed)
            .field("revision", &self.inner.registry.revision())
            .field("pool", &self.pool_stats())
            .finish()
    }
}

/// Builds the TCP or TLS transport the configuration asks for.
fn default_transport(config: &ClientConfig) -> Result<Arc<dyn Transport>> {
    let tcp = TcpTransportConfig {
        connect_timeout_ms: config.connect_timeout_ms,
        nodelay: true,
    };
    if config.tls.enabled {
        let tls = TlsTcpTransport::from_settings(tcp, &config.tls).map_err(|e| ClientError::Tls {
            reason: e.to_string(),
        })?;
        Ok(Arc::new(tls))
    } else {
        Ok(Arc::new(TcpTransport::new(tcp)))
    }
}

fn spawn_warm(pool: ConnectionPool, node: String) {
    tokio::spawn(async move {
        if let Err(fault) = pool.warm(&node).await {
            warn!(node = %node, fault = %fault, "could not pre-open connections");
        }
    });
}

impl Cluster {
    /// Bootstraps against the configured seeds over TCP, or TLS when enabled.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = default_transport(&config)?;
        Self::connect_with_transport(config, transport).await
    }

    /// Bootstraps using a caller-supplied transport.
    pub async fn connect_with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let seeds = match config.dns_srv {
            Some(_) => resolve_seeds(&config, &HickoryDnsClient::from_system_conf()?).await?,
            None => config.seed_addresses()?,
        };
        let outcome = Bootstrapper::new(transport.clone(), &config)
            .run(&seeds)
            .await?;

        let metrics = Arc::new(ClientMetrics::new());
        let (push_tx, pushes) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let mux = Arc::new(Multiplexer::new(push_tx, metrics.clone()));
        let connector = Arc::new(HandshakeConnector::new(
            transport,
            config.credentials.clone(),
            config.client_name.clone(),
            config.connect_timeout(),
            mux.clone(),
        ));
        let pool = ConnectionPool::new(config.pool, connector, metrics.clone());
        let registry = Arc::new(NodeRegistry::new(outcome.map, config.network));

        let (added, _) = pool.sync_nodes(&registry.addresses());
        for node in added {
            spawn_warm(pool.clone(), node);
        }

        let shutdown = CancellationToken::new();
        tokio::spawn(run_topology(
            registry.clone(),
            pool.clone(),
            metrics.clone(),
            pushes,
            shutdown.clone(),
        ));

        info!(
            seed = %outcome.seed,
            server_version = %outcome.server_version,
            revision = registry.revision(),
            nodes = pool.nodes().len(),
            "cluster connected"
        );

        Ok(Self {
            inner: Arc::new(ClusterInner {
                config,
                registry,
                dispatcher: Dispatcher::new(pool, mux),
                metrics,
                shutdown,
                seed: outcome.seed,
                server_version: outcome.server_version,
            }),
        })
    }

    /// Opens a session on `bucket`, sharing this cluster's connections.
    ///
    /// Fails with [`ClientError::InvalidConfig`] for an empty bucket name and
    /// with [`ClientError::SessionClosed`] once the cluster is shut down.
    pub fn bucket(&self, bucket: impl Into<String>) -> Result<Session> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(ClientError::InvalidConfig {
                reason: "bucket name cannot be empty".to_string(),
            });
        }
        if self.is_shut_down() {
            return Err(ClientError::SessionClosed);
        }
        let session = Session::with_state(bucket, &self.inner.config, SessionState::Open, false);
        // A fresh OnceLock; setting it cannot fail.
        let _ = session.inner.cluster.set(self.clone());
        Ok(session)
    }

    /// Configuration the cluster was connected with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Live topology, updated by pushed cluster maps.
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    /// Request dispatcher shared by every session.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.dispatcher.pool().stats()
    }

    /// The seed that answered during bootstrap.
    pub fn bootstrap_seed(&self) -> &str {
        &self.inner.seed
    }

    /// Version reported by the bootstrap seed.
    pub fn server_version(&self) -> &str {
        &self.inner.server_version
    }

    /// Stops the topology task and closes every pooled connection.
    ///
    /// Requests still running fail with `ConnectionLost` or `NoAvailableNode`.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.dispatcher.pool().shutdown();
        info!(seed = %self.inner.seed, "cluster shut down");
    }

    /// True once [`Cluster::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Applies pushed cluster maps and reaps idle connections until shutdown.
async fn run_topology(
    registry: Arc<NodeRegistry>,
    pool: ConnectionPool,
    metrics: Arc<ClientMetrics>,
    mut pushes: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) {
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            push = pushes.recv() => match push {
                Some(frame) => apply_push(&registry, &pool, &metrics, frame),
                None => break,
            },
            _ = reap.tick() => {
                pool.reap_idle();
            }
        }
    }
    debug!("topology task stopped");
}

fn apply_push(registry: &NodeRegistry, pool: &ConnectionPool, metrics: &ClientMetrics, frame: Frame) {
    if frame.opcode() != Opcode::ClusterMapPush {
        debug!(opcode = ?frame.opcode(), "ignoring server push");
        return;
    }
    let map = match ClusterMap::from_json(&frame.payload) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "discarding undecodable cluster map");
            return;
        }
    };
    if let MapUpdate::Applied { added, removed, .. } = registry.apply(map) {
        metrics.inc_cluster_map_updates();
        for node in added {
            if pool.add_node(&node) {
                spawn_warm(pool.clone(), node);
            }
        }
        for node in &removed {
            pool.drain_node(node);
        }
    }
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bootstrap is still running.
    Opening,
    /// Accepting operations.
    Open,
    /// `close()` is waiting for in-flight operations.
    Closing,
    /// Closed, or failed to open.
    Closed,
}

/// Per-call options for [`Session::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct OpOptions {
    /// Overrides the service timeout configured for the session.
    pub timeout: Option<Duration>,
    /// Resolves the operation with a `Cancelled` fault when triggered.
    pub cancel: Option<CancellationToken>,
}

impl OpOptions {
    /// Sets a per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cancels the call when `token` fires.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct SessionInner {
    bucket: String,
    state: watch::Sender<SessionState>,
    cluster: OnceLock<Cluster>,
    owns_cluster: bool,
    open_error: Mutex<Option<String>>,
    inflight: AtomicUsize,
    idle: Notify,
    force: CancellationToken,
    close_grace: Duration,
    timeouts: ServiceTimeouts,
}

impl SessionInner {
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn settled_state(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != SessionState::Opening)
            .await
            .map(|state| *state);
        state.unwrap_or(SessionState::Closed)
    }

    fn closed_fault(&self) -> Fault {
        let open_error = self.open_error.lock().unwrap_or_else(|p| p.into_inner());
        match open_error.as_deref() {
            Some(reason) => Fault::session_closed(format!(
                "session for bucket {} failed to open: {reason}",
                self.bucket
            )),
            None => Fault::session_closed(format!("session for bucket {} is closed", self.bucket)),
        }
    }
}

/// Counts one operation in flight; close waits for all of them.
struct InflightGuard {
    session: Arc<SessionInner>,
}

impl InflightGuard {
    fn new(session: Arc<SessionInner>) -> Self {
        session.inflight.fetch_add(1, Ordering::SeqCst);
        Self { session }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.session.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.idle.notify_waiters();
        }
    }
}

/// Handle to one bucket.
///
/// Clones share the same session; closing any clone closes all of them. Every
/// method is safe to call concurrently.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("bucket", &self.inner.bucket)
            .field("state", &self.state())
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl Session {
    fn with_state(bucket: String, config: &ClientConfig, state: SessionState, owns_cluster: bool) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            inner: Arc::new(SessionInner {
                bucket,
                state,
                cluster: OnceLock::new(),
                owns_cluster,
                open_error: Mutex::new(None),
                inflight: AtomicUsize::new(0),
                idle: Notify::new(),
                force: CancellationToken::new(),
                close_grace: config.close_grace(),
                timeouts: config.timeouts,
            }),
        }
    }

    /// Bootstraps a private cluster and opens `config.bucket` on it.
    pub async fn open(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = default_transport(&config)?;
        Self::open_with_transport(config, transport).await
    }

    /// Like [`Session::open`], using a caller-supplied transport.
    pub async fn open_with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let session = Self::with_state(config.bucket.clone(), &config, SessionState::Opening, true);
        let cluster = Cluster::connect_with_transport(config, transport).await?;
        let _ = session.inner.cluster.set(cluster);
        session.inner.state.send_replace(SessionState::Open);
        info!(bucket = %session.inner.bucket, "session open");
        Ok(session)
    }

    /// Returns at once with a session in the `Opening` state and bootstraps in
    /// the background.
    ///
    /// Operations issued meanwhile wait for bootstrap. If it fails they
    /// resolve with a `SessionClosed` fault carrying the reason.
    pub fn open_in_background(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = default_transport(&config)?;
        Self::open_in_background_with_transport(config, transport)
    }

    /// [`Session::open_in_background`] with a caller-supplied transport.
    pub fn open_in_background_with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let session = Self::with_state(config.bucket.clone(), &config, SessionState::Opening, true);
        let inner = session.inner.clone();
        tokio::spawn(async move {
            match Cluster::connect_with_transport(config, transport).await {
                Ok(cluster) => {
                    let _ = inner.cluster.set(cluster);
                    inner.state.send_replace(SessionState::Open);
                    info!(bucket = %inner.bucket, "session open");
                }
                Err(e) => {
                    warn!(bucket = %inner.bucket, error = %e, "session failed to open");
                    *inner.open_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                    inner.state.send_replace(SessionState::Closed);
                }
            }
        });
        Ok(session)
    }

    /// Bucket every operation of this session targets.
    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Operations currently in flight.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    /// The cluster this session runs on, once it is open.
    pub fn cluster(&self) -> Option<&Cluster> {
        self.inner.cluster.get()
    }

    /// Waits out `Opening` and registers an operation, or explains why none can start.
    async fn enter(&self) -> std::result::Result<(InflightGuard, Cluster), Fault> {
        if self.inner.settled_state().await != SessionState::Open {
            return Err(self.inner.closed_fault());
        }
        // Register first, then re-check, so close() either sees this
        // operation or this operation sees Closing.
        let guard = InflightGuard::new(self.inner.clone());
        if self.state() != SessionState::Open {
            return Err(self.inner.closed_fault());
        }
        match self.inner.cluster.get() {
            Some(cluster) => Ok((guard, cluster.clone())),
            None => Err(self.inner.closed_fault()),
        }
    }

    /// Runs `op` with the session's timeout for its service.
    pub async fn execute<O: Operation>(&self, op: O) -> OpResult<O::Output> {
        self.execute_with(op, OpOptions::default()).await
    }

    /// Runs `op` against the node that owns its key.
    ///
    /// Failures come back inside the [`OpResult`]; nothing is retried.
    pub async fn execute_with<O: Operation>(&self, op: O, options: OpOptions) -> OpResult<O::Output> {
        let (guard, cluster) = match self.enter().await {
            Ok(entered) => entered,
            Err(fault) => return OpResult::failed(fault),
        };

        let service = op.service();
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.timeouts.for_service(service));
        let deadline = Instant::now() + timeout;

        let node = match service {
            Service::KeyValue => cluster.registry().node_for_key(op.key()),
            other => cluster.registry().node_for_service(other),
        };
        let node = match node {
            Ok(node) => node,
            Err(fault) => return OpResult::failed(fault),
        };
        let payload = match op.encode(&self.inner.bucket) {
            Ok(payload) => payload,
            Err(fault) => return OpResult::failed(fault),
        };

        let cancel = options.cancel.unwrap_or_default();
        let response = tokio::select! {
            response = cluster
                .dispatcher()
                .send_cancellable(&node, op.opcode(), payload, deadline, &cancel) => response,
            _ = guard.session.force.cancelled() => Err(Fault::timeout(format!(
                "session for bucket {} closed before {:?} on {} completed",
                self.inner.bucket,
                op.opcode(),
                op.key()
            ))),
        };

        let result = match response {
            Ok(frame) => op.decode(frame),
            Err(fault) => OpResult::failed(fault),
        };
        if let Some(fault) = &result.fault {
            debug!(bucket = %self.inner.bucket, key = op.key(), opcode = ?op.opcode(), fault = %fault, "operation failed");
        }
        drop(guard);
        result
    }

    /// Fetches a document and deserializes its content.
    pub async fn get<T: DeserializeOwned + Send>(&self, id: &str) -> OpResult<Document<T>> {
        self.execute(Get::new(id)).await
    }

    /// Checks whether a document exists without fetching it.
    pub async fn exists(&self, id: &str) -> OpResult<bool> {
        self.execute(Exists::new(id)).await
    }

    /// Creates or overwrites a document.
    pub async fn upsert<T: Serialize + ?Sized>(&self, id: &str, content: &T) -> OpResult<()> {
        self.execute(Mutation::upsert(id, content)).await
    }

    /// Creates a document; fails with `KeyExists` if it is already there.
    pub async fn insert<T: Serialize + ?Sized>(&self, id: &str, content: &T) -> OpResult<()> {
        self.execute(Mutation::insert(id, content)).await
    }

    /// Overwrites a document; fails with `KeyNotFound` if it is missing.
    pub async fn replace<T: Serialize + ?Sized>(&self, id: &str, content: &T) -> OpResult<()> {
        self.execute(Mutation::replace(id, content)).await
    }

    /// Deletes a document.
    pub async fn remove(&self, id: &str) -> OpResult<()> {
        self.execute(Mutation::remove(id)).await
    }

    /// Resets a document's expiry.
    pub async fn touch(&self, id: &str, expiry_secs: u32) -> OpResult<()> {
        self.execute(Mutation::touch(id, expiry_secs)).await
    }

    /// Starts a query and returns once the server has sent the result header.
    ///
    /// Rows are read lazily from the returned [`QueryResult::rows`]; the
    /// request's timeout (or the session's query timeout) bounds the whole
    /// response.
    pub async fn query<T: DeserializeOwned>(&self, request: QueryRequest) -> OpResult<QueryResult<T>> {
        let (guard, cluster) = match self.enter().await {
            Ok(entered) => entered,
            Err(fault) => return OpResult::failed(fault),
        };
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.timeouts.for_service(Service::Query));
        let deadline = Instant::now() + timeout;
        let force = self.inner.force.clone();

        let started = tokio::select! {
            started = query::start(
                cluster.dispatcher(),
                cluster.registry(),
                cluster.inner.metrics.clone(),
                &self.inner.bucket,
                request,
                deadline,
                force.clone(),
            ) => started,
            _ = force.cancelled() => Err(Fault::timeout(format!(
                "session for bucket {} closed before the query started",
                self.inner.bucket
            ))),
        };
        drop(guard);
        started.into()
    }

    /// Closes the session using the configured grace period.
    pub async fn close(&self) -> Result<()> {
        self.close_with_grace(self.inner.close_grace).await
    }

    /// Stops accepting operations, waits up to `grace` for in-flight ones,
    /// fails the remainder with `Timeout` and moves to `Closed`. Row streams
    /// still open on the session end with `Timeout` on their next poll.
    ///
    /// Raises [`ClientError::SessionClosed`] if the session was already closing
    /// or closed.
    pub async fn close_with_grace(&self, grace: Duration) -> Result<()> {
        self.inner.settled_state().await;
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ClientError::SessionClosed);
        }

        let bucket = &self.inner.bucket;
        info!(bucket = %bucket, inflight = self.inflight(), "closing session");
        if tokio::time::timeout(grace, self.inner.wait_idle()).await.is_err() {
            warn!(
                bucket = %bucket,
                pending = self.inflight(),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed, failing in-flight operations"
            );
            self.inner.force.cancel();
            self.inner.wait_idle().await;
        }
        // Ends row streams still open on this session.
        self.inner.force.cancel();

        self.inner.state.send_replace(SessionState::Closed);
        if self.inner.owns_cluster {
            if let Some(cluster) = self.inner.cluster.get() {
                cluster.shutdown();
            }
        }
        info!(bucket = %bucket, "session closed");
        Ok(())
    }
}
