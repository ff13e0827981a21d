//! Request dispatch over pooled connections.
//!
//! Every request gets a fresh correlation id and a pending entry in the
//! [`Multiplexer`]. One reader task per connection receives frames and routes
//! them: responses to the pending entry with the same id, query stream frames
//! to the stream open on that connection, server pushes to the push channel.
//! A response whose id has no pending entry (it already timed out or was
//! cancelled) is logged and dropped.
//!
//! Each pending entry resolves exactly once: whoever removes it from the table
//! (the reader with a response, the caller on timeout or cancellation, or the
//! reader failing every request of a lost connection) is the one that settles it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bootstrap::handshake;
use crate::config::Credentials;
use crate::connection::{ConnectionId, ManagedConnection};
use crate::error::{Fault, TransportError};
use crate::metrics::ClientMetrics;
use crate::pool::{ConnectionPool, Connector, Lease};
use crate::protocol::{error_message, Frame, Opcode};
use crate::transport::Transport;

/// Capacity of the server push channel.
pub const PUSH_CHANNEL_CAPACITY: usize = 64;

struct PendingRequest {
    connection: ConnectionId,
    opcode: Opcode,
    sink: oneshot::Sender<Result<Frame, Fault>>,
}

/// Correlation id allocation and the table of requests awaiting a response.
pub struct Multiplexer {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    pushes: mpsc::Sender<Frame>,
    metrics: Arc<ClientMetrics>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Multiplexer {
    /// Creates a multiplexer forwarding server pushes to `pushes`.
    pub fn new(pushes: mpsc::Sender<Frame>, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            pushes,
            metrics,
        }
    }

    /// Counters shared with the pool and the dispatcher.
    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Allocates a correlation id. Ids are never reused within a process.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(
        &self,
        id: u64,
        connection: ConnectionId,
        opcode: Opcode,
    ) -> oneshot::Receiver<Result<Frame, Fault>> {
        let (sink, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                connection,
                opcode,
                sink,
            },
        );
        rx
    }

    /// Delivers a response to its pending request.
    ///
    /// Returns false if no request with that correlation id is pending.
    pub fn dispatch_response(&self, frame: Frame) -> bool {
        match self.pending.remove(&frame.correlation_id()) {
            Some((_, pending)) => {
                self.metrics.inc_responses_received();
                let _ = pending.sink.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Removes a pending request without settling it.
    ///
    /// Returns true if this call removed it.
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fails every request pending on `connection`. Returns how many were failed.
    pub fn fail_connection(&self, connection: ConnectionId, fault: &Fault) -> usize {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.connection == connection)
            .map(|entry| *entry.key())
            .collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                trace!(correlation_id = id, opcode = ?pending.opcode, "failing pending request");
                let _ = pending.sink.send(Err(fault.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Requests still waiting for a response, across every connection.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn route_push(&self, frame: Frame) {
        if let Err(e) = self.pushes.try_send(frame) {
            warn!(error = %e, "dropping server push");
        }
    }
}

/// Removes the pending entry if the request future is dropped before it settles.
struct PendingGuard<'a> {
    mux: &'a Multiplexer,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.mux.cancel(self.id);
    }
}

/// Starts the task that reads frames from `conn` until it closes.
pub(crate) fn spawn_reader(conn: Arc<ManagedConnection>, mux: Arc<Multiplexer>) -> JoinHandle<()> {
    let transport = conn.transport();
    let token = conn.shutdown_token();
    tokio::spawn(async move {
        let reason = loop {
            // With a stream open, claim buffer space before reading the next
            // frame so no more than one undelivered frame exists.
            let reserved = match conn.stream_route() {
                Some((id, tx)) => tokio::select! {
                    _ = token.cancelled() => break "closed locally".to_string(),
                    permit = tx.reserve_owned() => permit.ok().map(|p| (id, p)),
                },
                None => None,
            };

            let frame = tokio::select! {
                _ = token.cancelled() => break "closed locally".to_string(),
                frame = transport.recv_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(TransportError::Closed) => break "closed by peer".to_string(),
                Err(e) => break e.to_string(),
            };

            if frame.is_push() {
                mux.route_push(frame);
                continue;
            }

            let id = frame.correlation_id();
            if let Some(tx) = conn.stream_sender(id) {
                let opcode = frame.opcode();
                if opcode == Opcode::QueryEnd {
                    conn.close_stream(id);
                }
                match reserved {
                    Some((reserved_id, permit)) if reserved_id == id => {
                        permit.send(frame);
                    }
                    _ => {
                        tokio::select! {
                            _ = token.cancelled() => break "closed locally".to_string(),
                            _ = tx.send(frame) => {}
                        }
                    }
                }
                if opcode == Opcode::QueryRow {
                    mux.metrics.inc_rows_received();
                }
                continue;
            }

            if !mux.dispatch_response(frame) {
                mux.metrics.inc_unmatched_responses();
                debug!(conn_id = conn.id(), correlation_id = id, "dropping unmatched response");
            }
        };

        conn.close();
        conn.clear_stream();
        transport.shutdown().await;
        mux.metrics.inc_connections_closed();
        let fault = Fault::connection_lost(format!("connection to {} {}", conn.node(), reason));
        let failed = mux.fail_connection(conn.id(), &fault);
        if failed > 0 {
            warn!(conn_id = conn.id(), node = %conn.node(), failed, reason = %reason, "connection lost with requests in flight");
        } else {
            debug!(conn_id = conn.id(), node = %conn.node(), reason = %reason, "reader stopped");
        }
    })
}

/// Turns a non-success response into a server fault.
pub fn check_status(frame: Frame) -> Result<Frame, Fault> {
    if frame.status().is_success() {
        Ok(frame)
    } else {
        Err(Fault::server(frame.status(), error_message(&frame)))
    }
}

/// An open query stream: the leased connection, its correlation id and the
/// receiving end of the one-slot frame channel.
pub(crate) struct StreamHandle {
    pub(crate) lease: Lease,
    pub(crate) correlation_id: u64,
    pub(crate) frames: mpsc::Receiver<Frame>,
}

/// Sends requests to nodes through the pool and awaits their responses.
#[derive(Clone)]
pub struct Dispatcher {
    pool: ConnectionPool,
    mux: Arc<Multiplexer>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &self.pool)
            .field("mux", &self.mux)
            .finish()
    }
}

impl Dispatcher {
    /// Dispatches over `pool`, correlating responses through `mux`.
    pub fn new(pool: ConnectionPool, mux: Arc<Multiplexer>) -> Self {
        Self { pool, mux }
    }

    /// The pool requests are leased from.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The correlation table shared by every connection.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Sends one request to `node` and waits for its response until `deadline`.
    ///
    /// The request shares its connection with other requests in flight to the
    /// same node, up to the pool's per-connection limit. The raw response frame
    /// is returned whatever its status; see [`check_status`]. Nothing is
    /// retried. Dropping the returned future cancels the request: the pending
    /// entry is removed and the connection is released, and a response
    /// arriving later is discarded.
    pub async fn send(
        &self,
        node: &str,
        opcode: Opcode,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Frame, Fault> {
        let lease = self.pool.acquire_shared(node, deadline).await?;
        let conn = lease.connection();
        let id = self.mux.next_id();
        let mut rx = self.mux.register(id, conn.id(), opcode);
        let _guard = PendingGuard { mux: &self.mux, id };

        if let Err(e) = conn.send(&Frame::request(opcode, id, payload)).await {
            conn.close();
            return Err(e.into());
        }
        self.mux.metrics.inc_requests_sent();

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Fault::connection_lost(format!(
                "connection to {node} closed before request {id} completed"
            ))),
            Err(_) => {
                if self.mux.cancel(id) {
                    self.mux.metrics.inc_timeouts();
                    debug!(node = node, correlation_id = id, ?opcode, "request timed out");
                    Err(Fault::timeout(format!(
                        "{opcode:?} request {id} to {node} got no response before its deadline"
                    )))
                } else {
                    // Settled concurrently with the deadline; take what was delivered.
                    rx.try_recv().unwrap_or_else(|_| {
                        Err(Fault::connection_lost(format!("request {id} to {node} was abandoned")))
                    })
                }
            }
        }
    }

    /// Like [`Dispatcher::send`], resolving to a `Cancelled` fault when `cancel` fires first.
    pub async fn send_cancellable(
        &self,
        node: &str,
        opcode: Opcode,
        payload: Bytes,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Frame, Fault> {
        tokio::select! {
            result = self.send(node, opcode, payload, deadline) => result,
            _ = cancel.cancelled() => {
                self.mux.metrics.inc_cancelled();
                Err(Fault::cancelled(format!("{opcode:?} request to {node} cancelled by caller")))
            }
        }
    }

    /// Sends a request whose answer is a sequence of frames, such as a query.
    ///
    /// The connection stays leased to the returned handle until the stream ends.
    pub(crate) async fn open_stream(
        &self,
        node: &str,
        opcode: Opcode,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<StreamHandle, Fault> {
        let lease = self.pool.acquire(node, deadline).await?;
        let id = self.mux.next_id();
        let (tx, frames) = mpsc::channel(1);
        let conn = lease.connection();
        if !conn.open_stream(id, tx) {
            conn.close();
            return Err(Fault::connection_lost(format!(
                "connection to {node} already carries a stream"
            )));
        }
        if let Err(e) = conn.send(&Frame::request(opcode, id, payload)).await {
            conn.close();
            return Err(e.into());
        }
        self.mux.metrics.inc_requests_sent();
        Ok(StreamHandle {
            lease,
            correlation_id: id,
            frames,
        })
    }
}

/// Pool connector that dials through a [`Transport`], runs the handshake and
/// starts the connection's reader task.
pub struct HandshakeConnector {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    client_name: String,
    connect_timeout: std::time::Duration,
    mux: Arc<Multiplexer>,
    next_conn_id: AtomicU64,
}

impl std::fmt::Debug for HandshakeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeConnector")
            .field("client_name", &self.client_name)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl HandshakeConnector {
    /// Dials through `transport` and runs `Hello` and `Authenticate` on each new connection.
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        client_name: impl Into<String>,
        connect_timeout: std::time::Duration,
        mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            transport,
            credentials,
            client_name: client_name.into(),
            connect_timeout,
            mux,
            next_conn_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Connector for HandshakeConnector {
    async fn connect(&self, node: &str) -> Result<Arc<ManagedConnection>, Fault> {
        let setup = async {
            let conn = self.transport.connect(node).await.map_err(Fault::from)?;
            handshake(conn.as_ref(), &self.client_name, &self.credentials)
                .await
                .map_err(Fault::from)?;
            Ok::<_, Fault>(conn)
        };
        let conn = tokio::time::timeout(self.connect_timeout, setup)
            .await
            .map_err(|_| {
                Fault::timeout(format!(
                    "connecting to {node} took longer than {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let managed = Arc::new(ManagedConnection::new(id, node, conn));
        managed.mark_ready();
        spawn_reader(managed.clone(), self.mux.clone());
        self.mux.metrics.inc_connections_opened();
        debug!(conn_id = id, node = node, "pool connection ready");
        Ok(managed)
    }
}
