//! Client-side counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of client metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests written to a connection.
    pub requests_sent: u64,
    /// Responses matched to a pending request.
    pub responses_received: u64,
    /// Requests whose deadline elapsed before a response arrived.
    pub timeouts: u64,
    /// Responses whose correlation id matched no pending request.
    pub unmatched_responses: u64,
    /// Requests resolved by a caller's cancellation token.
    pub cancelled: u64,
    /// Connections that completed the handshake.
    pub connections_opened: u64,
    /// Pooled connections closed for any reason.
    pub connections_closed: u64,
    /// Acquires that gave up waiting for a pooled connection.
    pub pool_exhausted: u64,
    /// Query rows handed from a connection to a row stream.
    pub rows_received: u64,
    /// Query rows yielded to callers.
    pub rows_streamed: u64,
    /// Cluster maps applied from pushes.
    pub cluster_map_updates: u64,
}

/// Thread-safe metrics collector shared by every component of one cluster.
#[derive(Default)]
pub struct ClientMetrics {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    timeouts: AtomicU64,
    unmatched_responses: AtomicU64,
    cancelled: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    pool_exhausted: AtomicU64,
    rows_received: AtomicU64,
    rows_streamed: AtomicU64,
    cluster_map_updates: AtomicU64,
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ClientMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a request written to a connection.
    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a matched response.
    pub fn inc_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request that hit its deadline.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a response no pending request was waiting for.
    pub fn inc_unmatched_responses(&self) {
        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request ended by its cancellation token.
    pub fn inc_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a connection that finished its handshake.
    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a pooled connection that was closed.
    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an acquire that timed out.
    pub fn inc_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a row read off the wire for a stream.
    pub fn inc_rows_received(&self) {
        self.rows_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a row handed to the caller.
    pub fn inc_rows_streamed(&self) {
        self.rows_streamed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an applied cluster map.
    pub fn inc_cluster_map_updates(&self) {
        self.cluster_map_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            rows_received: self.rows_received.load(Ordering::Relaxed),
            rows_streamed: self.rows_streamed.load(Ordering::Relaxed),
            cluster_map_updates: self.cluster_map_updates.load(Ordering::Relaxed),
        }
    }
}
