//! Lazily consumed query rows.
//!
//! The connection reader forwards a query's frames through a one-slot channel
//! and reserves that slot before reading the next frame from the socket, so at
//! most one row sits decoded but undelivered between the network and the
//! caller. Socket backpressure does the rest.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::connection::ManagedConnection;
use crate::dispatcher::StreamHandle;
use crate::error::Fault;
use crate::metrics::ClientMetrics;
use crate::pool::Lease;
use crate::protocol::{error_message, Frame, Opcode, Status};
use crate::query::{QueryMeta, QueryStatus};

/// Rows of a running query, deserialized into `T` one at a time.
///
/// The stream ends after the server's end-of-results frame; the metadata it
/// carried is then available from [`RowStream::meta`]. A fault ends the stream
/// after being yielded once. Dropping the stream before it ends closes the
/// underlying connection, which stops the server from sending more rows.
/// Closing the session the query ran on ends the stream with a `Timeout` fault
/// and closes its connection at once, whether or not the stream is polled again.
pub struct RowStream<T> {
    frames: mpsc::Receiver<Frame>,
    lease: Option<Lease>,
    released: CancellationToken,
    correlation_id: u64,
    deadline: Pin<Box<Sleep>>,
    forced: Pin<Box<WaitForCancellationFutureOwned>>,
    meta: Option<QueryMeta>,
    done: bool,
    metrics: Arc<ClientMetrics>,
    _row: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for RowStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("correlation_id", &self.correlation_id)
            .field("done", &self.done)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Closes `conn` if `force` fires while the stream still holds it.
fn spawn_close_on_force(conn: Arc<ManagedConnection>, force: CancellationToken, released: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = released.cancelled() => {}
            _ = force.cancelled() => {
                if conn.close() {
                    debug!(conn_id = conn.id(), node = %conn.node(), "closed query stream connection on session close");
                }
            }
        }
    });
}

impl<T> RowStream<T> {
    pub(crate) fn new(
        handle: StreamHandle,
        deadline: Instant,
        metrics: Arc<ClientMetrics>,
        force: CancellationToken,
    ) -> Self {
        let released = CancellationToken::new();
        spawn_close_on_force(handle.lease.connection().clone(), force.clone(), released.clone());
        Self {
            frames: handle.frames,
            lease: Some(handle.lease),
            released,
            correlation_id: handle.correlation_id,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            forced: Box::pin(force.cancelled_owned()),
            meta: None,
            done: false,
            metrics,
            _row: PhantomData,
        }
    }

    /// Metadata from the end-of-results frame, once the stream has ended cleanly.
    pub fn meta(&self) -> Option<&QueryMeta> {
        self.meta.as_ref()
    }

    /// True once the stream has ended, successfully or not.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Ends the stream with `fault`, closing the connection mid-response.
    fn abort(&mut self, fault: Fault) -> Fault {
        self.done = true;
        self.released.cancel();
        if let Some(lease) = self.lease.take() {
            debug!(
                correlation_id = self.correlation_id,
                node = lease.node(),
                fault = %fault,
                "abandoning query stream"
            );
            lease.discard();
        }
        fault
    }

    /// Ends the stream after the server finished; the connection is reusable.
    fn finish(&mut self) {
        self.done = true;
        self.released.cancel();
        self.lease = None;
    }
}

impl<T: DeserializeOwned> RowStream<T> {
    fn on_frame(&mut self, frame: Frame) -> Option<Result<T, Fault>> {
        if !frame.status().is_success() {
            return Some(Err(self.abort(Fault::server(frame.status(), error_message(&frame)))));
        }
        match frame.opcode() {
            Opcode::QueryRow => match serde_json::from_slice::<T>(&frame.payload) {
                Ok(row) => {
                    self.metrics.inc_rows_streamed();
                    Some(Ok(row))
                }
                Err(e) => Some(Err(self.abort(Fault::malformed(format!(
                    "query row does not match the requested type: {e}"
                ))))),
            },
            Opcode::QueryEnd => {
                let meta: QueryMeta = match serde_json::from_slice(&frame.payload) {
                    Ok(meta) => meta,
                    Err(e) => {
                        return Some(Err(
                            self.abort(Fault::malformed(format!("query metadata: {e}")))
                        ))
                    }
                };
                self.finish();
                let failed = meta.status != QueryStatus::Success;
                let summary = meta.error_summary();
                self.meta = Some(meta);
                failed.then(|| Err(Fault::server(Status::QueryError, summary)))
            }
            other => Some(Err(self.abort(Fault::malformed(format!(
                "unexpected {other:?} frame inside a query response"
            ))))),
        }
    }

    /// Reads every remaining row, then returns them with the query metadata.
    pub async fn collect_all(mut self) -> Result<(Vec<T>, QueryMeta), Fault> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok((rows, self.meta.take().unwrap_or_default()))
    }
}

impl<T: DeserializeOwned> Stream for RowStream<T> {
    type Item = Result<T, Fault>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.forced.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(
                this.abort(Fault::timeout("session closed before the query finished"))
            )));
        }
        if this.deadline.as_mut().poll(cx).is_ready() {
            this.metrics.inc_timeouts();
            return Poll::Ready(Some(Err(this.abort(Fault::timeout(format!(
                "query {} did not finish before its deadline",
                this.correlation_id
            ))))));
        }

        match this.frames.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(Some(Err(this.abort(Fault::connection_lost(
                "connection closed in the middle of a query response",
            ))))),
            Poll::Ready(Some(frame)) => Poll::Ready(this.on_frame(frame)),
        }
    }
}

impl<T> Drop for RowStream<T> {
    fn drop(&mut self) {
        self.released.cancel();
        if !self.done {
            if let Some(lease) = self.lease.take() {
                debug!(correlation_id = self.correlation_id, "query stream dropped before its end");
                lease.discard();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::dispatcher::{spawn_reader, Dispatcher, Multiplexer, PUSH_CHANNEL_CAPACITY};
    use crate::error::FaultKind;
    use crate::pool::{ConnectionPool, Connector};
    use crate::query::QueryMetrics;
    use crate::transport::{Connection, FramedConnection};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Row {
        n: u64,
    }

    struct DuplexConnector {
        mux: Arc<Multiplexer>,
        servers: mpsc::UnboundedSender<FramedConnection<DuplexStream>>,
        next_id: AtomicU64,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, node: &str) -> Result<Arc<ManagedConnection>, Fault> {
            // Small buffers so the server feels backpressure quickly.
            let (a, b) = tokio::io::duplex(256);
            let _ = self.servers.send(FramedConnection::new(b, "client"));
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let conn = Arc::new(ManagedConnection::new(id, node, Box::new(FramedConnection::new(a, node))));
            conn.mark_ready();
            spawn_reader(conn.clone(), self.mux.clone());
            Ok(conn)
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        metrics: Arc<ClientMetrics>,
        servers: mpsc::UnboundedReceiver<FramedConnection<DuplexStream>>,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(ClientMetrics::new());
        let (push_tx, _) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let mux = Arc::new(Multiplexer::new(push_tx, metrics.clone()));
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(DuplexConnector {
            mux: mux.clone(),
            servers: servers_tx,
            next_id: AtomicU64::new(0),
        });
        let config = PoolConfig {
            min_per_node: 0,
            max_per_node: 1,
            max_requests_per_connection: 8,
            idle_timeout_ms: 60_000,
        };
        let pool = ConnectionPool::new(config, connector, metrics.clone());
        pool.add_node("q:1");
        Harness {
            dispatcher: Dispatcher::new(pool, mux),
            metrics,
            servers,
        }
    }

    async fn open(h: &mut Harness, timeout: Duration) -> (RowStream<Row>, FramedConnection<DuplexStream>, Frame) {
        open_with_force(h, timeout, CancellationToken::new()).await
    }

    async fn open_with_force(
        h: &mut Harness,
        timeout: Duration,
        force: CancellationToken,
    ) -> (RowStream<Row>, FramedConnection<DuplexStream>, Frame) {
        let handle = h
            .dispatcher
            .open_stream("q:1", Opcode::Query, Bytes::from_static(b"{}"), Instant::now() + timeout)
            .await
            .unwrap();
        let server = h.servers.recv().await.unwrap();
        let request = server.recv_frame().await.unwrap();
        let rows = RowStream::new(handle, Instant::now() + timeout, h.metrics.clone(), force);
        (rows, server, request)
    }

    fn row(request: &Frame, n: u64) -> Frame {
        request.make_response_as(Opcode::QueryRow, Status::Success, format!(r#"{{"n":{n}}}"#).into_bytes())
    }

    fn end(request: &Frame, meta: &str) -> Frame {
        request.make_response_as(Opcode::QueryEnd, Status::Success, meta.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_rows_then_meta() {
        let mut h = harness();
        let (mut rows, server, request) = open(&mut h, Duration::from_secs(5)).await;
        let producer = tokio::spawn(async move {
            for n in 0..3 {
                server.send_frame(&row(&request, n)).await.unwrap();
            }
            server
                .send_frame(&end(&request, r#"{"status":"success","metrics":{"result_count":3}}"#))
                .await
                .unwrap();
            server
        });

        let mut seen = Vec::new();
        while let Some(r) = rows.next().await {
            seen.push(r.unwrap().n);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(
            rows.meta().unwrap().metrics,
            QueryMetrics {
                result_count: 3,
                ..QueryMetrics::default()
            }
        );
        assert!(rows.next().await.is_none());
        let _server = producer.await.unwrap();
        drop(rows);
        // The connection went back to the pool.
        assert_eq!(h.dispatcher.pool().stats().idle, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_undelivered_row() {
        const TOTAL: u64 = 10_000;
        let mut h = harness();
        let (mut rows, server, request) = open(&mut h, Duration::from_secs(60)).await;
        let producer = tokio::spawn(async move {
            for n in 0..TOTAL {
                server.send_frame(&row(&request, n)).await.unwrap();
            }
            server.send_frame(&end(&request, r#"{"status":"success"}"#)).await.unwrap();
        });

        let mut count = 0;
        while let Some(r) = rows.next().await {
            assert_eq!(r.unwrap().n, count);
            count += 1;
            // Give the reader every chance to run ahead.
            tokio::task::yield_now().await;
            let m = h.metrics.snapshot();
            assert!(
                m.rows_received - m.rows_streamed <= 1,
                "received {} streamed {}",
                m.rows_received,
                m.rows_streamed
            );
        }
        assert_eq!(count, TOTAL);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_row_is_terminal_malformed() {
        let mut h = harness();
        let (mut rows, server, request) = open(&mut h, Duration::from_secs(5)).await;
        server
            .send_frame(&request.make_response_as(Opcode::QueryRow, Status::Success, b"{\"x\":1}".to_vec()))
            .await
            .unwrap();

        let err = rows.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, FaultKind::MalformedResponse);
        assert!(rows.next().await.is_none());
        assert_eq!(h.dispatcher.pool().stats().idle, 0);
    }

    #[tokio::test]
    async fn test_query_errors_in_meta() {
        let mut h = harness();
        let (mut rows, server, request) = open(&mut h, Duration::from_secs(5)).await;
        server
            .send_frame(&end(
                &request,
                r#"{"status":"errors","errors":[{"code":4000,"message":"no index"}]}"#,
            ))
            .await
            .unwrap();

        let err = rows.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, FaultKind::Server(Status::QueryError));
        assert!(err.message.contains("no index"));
        assert_eq!(rows.meta().unwrap().status, QueryStatus::Errors);
    }

    #[tokio::test]
    async fn test_connection_loss_mid_stream() {
        let mut h = harness();
        let (mut rows, server, request) = open(&mut h, Duration::from_secs(5)).await;
        server.send_frame(&row(&request, 1)).await.unwrap();
        drop(server);

        assert_eq!(rows.next().await.unwrap().unwrap().n, 1);
        let err = rows.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, FaultKind::ConnectionLost);
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn test_deadline_ends_stream() {
        let mut h = harness();
        let (mut rows, _server, _request) = open(&mut h, Duration::from_millis(50)).await;
        let err = rows.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, FaultKind::Timeout);
        assert_eq!(h.metrics.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_early_drop_closes_connection() {
        let mut h = harness();
        let (mut rows, server, request) = open(&mut h, Duration::from_secs(5)).await;
        server.send_frame(&row(&request, 1)).await.unwrap();
        assert!(rows.next().await.unwrap().is_ok());
        assert_eq!(h.dispatcher.pool().stats().leased, 1);

        drop(rows);
        assert_eq!(h.dispatcher.pool().stats(), crate::pool::PoolStats { nodes: 1, idle: 0, leased: 0, requests: 0 });
        // The server sees the connection close.
        assert!(server.recv_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_force_closes_connection_of_unpolled_stream() {
        let mut h = harness();
        let force = CancellationToken::new();
        let (mut rows, server, request) = open_with_force(&mut h, Duration::from_secs(5), force.clone()).await;
        server.send_frame(&row(&request, 0)).await.unwrap();

        force.cancel();
        // Nothing polls the stream, yet the socket goes away.
        assert!(server.recv_frame().await.is_err());

        let err = rows.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, FaultKind::Timeout);
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn test_finished_stream_connection_survives_force() {
        let mut h = harness();
        let force = CancellationToken::new();
        let (mut rows, server, request) = open_with_force(&mut h, Duration::from_secs(5), force.clone()).await;
        server.send_frame(&end(&request, r#"{"status":"success"}"#)).await.unwrap();
        assert!(rows.next().await.is_none());
        drop(rows);

        force.cancel();
        tokio::task::yield_now().await;
        assert_eq!(h.dispatcher.pool().stats().idle, 1);
        assert_eq!(h.metrics.snapshot().connections_closed, 0);
    }
}
