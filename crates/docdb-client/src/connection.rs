//! A pooled connection to one node.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;
use crate::protocol::Frame;
use crate::transport::Connection;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Lifecycle of a [`ManagedConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Dialling or handshaking; not yet handed to the pool.
    Connecting = 0,
    /// Usable for new requests.
    Ready = 1,
    /// In-flight work may finish; no new work is accepted.
    Draining = 2,
    /// Unusable.
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Where the reader task forwards the frames of an open query stream.
pub(crate) struct StreamRoute {
    pub(crate) correlation_id: u64,
    pub(crate) tx: mpsc::Sender<Frame>,
}

/// One transport connection plus the bookkeeping the pool and dispatcher need.
pub struct ManagedConnection {
    id: ConnectionId,
    node: String,
    conn: Arc<dyn Connection>,
    state: AtomicU8,
    created_at: Instant,
    shutdown: CancellationToken,
    stream: Mutex<Option<StreamRoute>>,
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedConnection {
    /// Wraps a freshly dialled connection in the `Connecting` state.
    pub fn new(id: ConnectionId, node: impl Into<String>, conn: Box<dyn Connection>) -> Self {
        Self {
            id,
            node: node.into(),
            conn: Arc::from(conn),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            created_at: Instant::now(),
            shutdown: CancellationToken::new(),
            stream: Mutex::new(None),
        }
    }

    /// Process-unique id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The `host:port` this connection was dialled to.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// True until the connection starts draining or closes.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Time since the connection was dialled.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Connecting -> Ready, after the handshake succeeded.
    pub fn mark_ready(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Ready)
    }

    /// Ready -> Draining. Returns false if the connection was not Ready.
    pub fn mark_draining(&self) -> bool {
        self.transition(ConnectionState::Ready, ConnectionState::Draining)
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Closes the connection and stops its reader task.
    ///
    /// Returns true the first time, false if it was already closed.
    pub fn close(&self) -> bool {
        let prev = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.shutdown.cancel();
        let first = ConnectionState::from(prev) != ConnectionState::Closed;
        if first {
            debug!(conn_id = self.id, node = %self.node, "connection closed");
        }
        first
    }

    /// Writes one frame. Concurrent writers are serialized.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.conn.send_frame(frame).await
    }

    pub(crate) fn transport(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Routes frames carrying `correlation_id` to `tx`. Fails if a stream is already open.
    pub(crate) fn open_stream(&self, correlation_id: u64, tx: mpsc::Sender<Frame>) -> bool {
        let mut slot = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(StreamRoute { correlation_id, tx });
        true
    }

    /// Sender for the stream with this correlation id, if one is open.
    pub(crate) fn stream_sender(&self, correlation_id: u64) -> Option<mpsc::Sender<Frame>> {
        let slot = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref()
            .filter(|route| route.correlation_id == correlation_id)
            .map(|route| route.tx.clone())
    }

    /// The open stream's correlation id and sender, if any.
    pub(crate) fn stream_route(&self) -> Option<(u64, mpsc::Sender<Frame>)> {
        let slot = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref()
            .map(|route| (route.correlation_id, route.tx.clone()))
    }

    pub(crate) fn clear_stream(&self) {
        *self.stream.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub(crate) fn close_stream(&self, correlation_id: u64) {
        let mut slot = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        if slot
            .as_ref()
            .is_some_and(|route| route.correlation_id == correlation_id)
        {
            *slot = None;
        }
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramedConnection;

    fn managed(id: ConnectionId) -> (ManagedConnection, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(256);
        let conn = ManagedConnection::new(id, "node-a:11210", Box::new(FramedConnection::new(a, "node-a:11210")));
        (conn, b)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (conn, _peer) = managed(1);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.mark_draining());
        assert!(conn.mark_ready());
        assert!(conn.is_ready());
        assert!(conn.mark_draining());
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_stream_route_single_slot() {
        let (conn, _peer) = managed(2);
        let (tx, _rx) = mpsc::channel(1);
        assert!(conn.open_stream(10, tx.clone()));
        assert!(!conn.open_stream(11, tx));
        assert!(conn.stream_sender(10).is_some());
        assert!(conn.stream_sender(11).is_none());

        conn.close_stream(11);
        assert!(conn.has_stream());
        assert_eq!(conn.stream_route().map(|(id, _)| id), Some(10));
        conn.close_stream(10);
        assert!(!conn.has_stream());
        assert!(conn.open_stream(12, mpsc::channel(1).0));
        conn.clear_stream();
        assert!(conn.stream_route().is_none());
    }
}
