//! TLS support for node connections.
//!
//! The client verifies servers against a configured CA bundle. Client
//! certificates are not presented; authentication happens in-band with the
//! `Authenticate` frame.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use tracing::debug;

use crate::config::TlsSettings;
use crate::error::TransportError;
use crate::tcp::{TcpTransport, TcpTransportConfig};
use crate::transport::{Connection, FramedConnection, Transport};

/// Client-side TLS connector.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a connector trusting the CA certificates in `ca_cert_pem`.
    pub fn from_pem(ca_cert_pem: &[u8]) -> Result<Self, TransportError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let ca_certs = load_certs_from_pem(ca_cert_pem)?;

        let mut root_store = rustls::RootCertStore::empty();
        for cert in ca_certs {
            root_store.add(cert).map_err(|e| TransportError::Tls {
                reason: format!("failed to add CA cert: {e}"),
            })?;
        }

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Runs the TLS handshake over an established stream.
    pub async fn connect<IO>(
        &self,
        domain: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>, TransportError>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let name = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| TransportError::Tls {
                reason: format!("invalid server name {domain:?}: {e}"),
            })?
        };
        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::Tls {
                reason: e.to_string(),
            })
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        if let rustls_pemfile::Item::X509Certificate(cert) = item {
            certs.push(cert);
        }
    }

    if certs.is_empty() {
        return Err(TransportError::Tls {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Host part of a `host:port` address, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// TCP transport wrapped in TLS.
#[derive(Debug, Clone)]
pub struct TlsTcpTransport {
    tcp: TcpTransport,
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsTcpTransport {
    /// TLS over TCP using a prepared rustls connector.
    pub fn new(tcp_config: TcpTransportConfig, connector: TlsConnector) -> Self {
        Self {
            tcp: TcpTransport::new(tcp_config),
            connector,
            server_name: None,
        }
    }

    /// Builds the transport from client TLS settings.
    pub fn from_settings(
        tcp_config: TcpTransportConfig,
        settings: &TlsSettings,
    ) -> Result<Self, TransportError> {
        let pem = settings.ca_cert_pem.as_deref().unwrap_or_default();
        let connector = TlsConnector::from_pem(pem.as_bytes())?;
        Ok(Self {
            server_name: settings.server_name.clone(),
            ..Self::new(tcp_config, connector)
        })
    }

    /// Verifies every server certificate against this name instead of the dialled host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Transport for TlsTcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let stream = self.tcp.dial(addr).await?;
        let domain = self.server_name.as_deref().unwrap_or_else(|| host_of(addr));
        let tls = self.connector.connect(domain, stream).await?;
        debug!(addr = addr, server_name = domain, "TLS connected");
        Ok(Box::new(FramedConnection::new(tls, addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, Opcode, Status};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    struct TestPki {
        ca_pem: String,
        leaf_der: CertificateDer<'static>,
        leaf_key_der: Vec<u8>,
    }

    fn make_pki(name: &str) -> TestPki {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(vec!["docdb test ca".to_string()]).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        TestPki {
            ca_pem: ca_cert.pem(),
            leaf_der: leaf.der().clone(),
            leaf_key_der: leaf_key.serialize_der(),
        }
    }

    fn acceptor(pki: &TestPki) -> tokio_rustls::TlsAcceptor {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki.leaf_key_der.clone()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![pki.leaf_der.clone()], key)
            .unwrap();
        tokio_rustls::TlsAcceptor::from(Arc::new(config))
    }

    #[test]
    fn test_load_certs_rejects_empty_pem() {
        let err = load_certs_from_pem(b"not a pem").unwrap_err();
        assert!(matches!(err, TransportError::Tls { .. }));
    }

    #[test]
    fn test_load_certs_from_generated_ca() {
        let pki = make_pki("localhost");
        let certs = load_certs_from_pem(pki.ca_pem.as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("db1.example.com:11207"), "db1.example.com");
        assert_eq!(host_of("[::1]:11207"), "::1");
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_tls_roundtrip() {
        let pki = make_pki("localhost");
        let acceptor = acceptor(&pki);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let tls = acceptor.accept(stream).await.unwrap();
            let conn = FramedConnection::new(tls, peer.to_string());
            let frame = conn.recv_frame().await.unwrap();
            conn.send_frame(&frame.make_response(Status::Success, b"secure".to_vec()))
                .await
                .unwrap();
        });

        let connector = TlsConnector::from_pem(pki.ca_pem.as_bytes()).unwrap();
        let transport = TlsTcpTransport::new(TcpTransportConfig::default(), connector)
            .with_server_name("localhost");
        let conn = transport.connect(&format!("127.0.0.1:{port}")).await.unwrap();
        conn.send_frame(&Frame::request(Opcode::Noop, 5, vec![]))
            .await
            .unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert_eq!(response.correlation_id(), 5);
        assert_eq!(&response.payload[..], b"secure");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_rejects_untrusted_server() {
        let server_pki = make_pki("localhost");
        let other_pki = make_pki("localhost");
        let acceptor = acceptor(&server_pki);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = acceptor.accept(stream).await;
        });

        let connector = TlsConnector::from_pem(other_pki.ca_pem.as_bytes()).unwrap();
        let transport = TlsTcpTransport::new(TcpTransportConfig::default(), connector)
            .with_server_name("localhost");
        let err = transport
            .connect(&format!("127.0.0.1:{port}"))
            .await
            .err().expect("connect should fail");
        assert!(matches!(err, TransportError::Tls { .. }));
    }
}
