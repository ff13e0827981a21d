//! TCP transport implementation.

use async_trait::async_trait;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{Connection, FramedConnection, Transport};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            nodelay: true,
        }
    }
}

/// Plain TCP transport.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// A TCP transport with the given connect settings.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Opens a raw TCP stream honouring the connect timeout and nodelay setting.
    pub(crate) async fn dial(&self, addr: &str) -> Result<tokio::net::TcpStream, TransportError> {
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let stream = self.dial(addr).await?;
        debug!(addr = addr, "TCP connected");
        Ok(Box::new(FramedConnection::new(stream, addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Opcode, Status};

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let conn = FramedConnection::new(stream, peer.to_string());
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.opcode(), Opcode::Noop);
            conn.send_frame(&frame.make_response(Status::Success, b"pong".to_vec()))
                .await
                .unwrap();
        });

        let transport = TcpTransport::default();
        let conn = transport.connect(&addr).await.unwrap();
        assert_eq!(conn.peer_addr(), addr);
        conn.send_frame(&Frame::request(Opcode::Noop, 1, b"ping".to_vec()))
            .await
            .unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert!(response.is_response());
        assert_eq!(&response.payload[..], b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::default();
        let err = transport.connect(&addr).await.err().expect("connect should fail");
        assert!(matches!(err, TransportError::Io(_)));
    }
}
