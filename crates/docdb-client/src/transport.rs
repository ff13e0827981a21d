//! Abstract transport layer.
//!
//! A [`Transport`] dials a node and yields a [`Connection`] that sends and
//! receives whole frames. Sends and receives may run concurrently: the read and
//! write halves are locked independently, so one task can sit in
//! `recv_frame` while others write requests.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// Dials nodes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the node at `addr` (`host:port`).
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established, frame-oriented connection to one node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Writes one complete frame.
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Receives the next frame. Returns [`TransportError::Closed`] on clean EOF.
    async fn recv_frame(&self) -> Result<Frame, TransportError>;

    /// Closes the write side; the peer sees EOF.
    async fn shutdown(&self);

    /// The `host:port` this connection was opened to.
    fn peer_addr(&self) -> &str;
}

/// Frame codec over any byte stream (TCP, TLS, in-memory duplex).
pub struct FramedConnection<S> {
    read: Mutex<ReadHalf<S>>,
    write: Mutex<WriteHalf<S>>,
    peer_addr: String,
}

impl<S> std::fmt::Debug for FramedConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer_addr: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr: peer_addr.into(),
        }
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await?;
        write.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        match read.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TransportError::Closed
                } else {
                    e.into()
                }
            })?;
        }
        Ok(Frame {
            header,
            payload: payload.into(),
        })
    }

    async fn shutdown(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}
