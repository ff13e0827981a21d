//! Cluster bootstrap.
//!
//! Seeds are tried strictly in the configured order. Against each one the
//! client connects, says `Hello`, authenticates and fetches the cluster map.
//! The first seed to complete all steps wins and the seed list is not consulted
//! again: from then on the node set comes from the cluster map alone. If every
//! seed fails, the error lists each seed with the reason it failed.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, Credentials};
use crate::error::{
    ClientError, Fault, ProtocolError, Result, SeedFailure, SeedFailureKind, TransportError,
};
use crate::protocol::{
    decode_body, encode_body, error_message, AuthRequest, Frame, HelloRequest, HelloResponse,
    Opcode, Status,
};
use crate::topology::ClusterMap;
use crate::transport::{Connection, Transport};

/// Features announced in `Hello`.
pub const CLIENT_FEATURES: &[&str] = &["json", "query-streaming", "cluster-map-push"];

const HELLO_ID: u64 = 1;
const AUTH_ID: u64 = 2;
const CLUSTER_MAP_ID: u64 = 3;

/// Failure while setting up a connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Could not reach the seed or lost it mid-handshake.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The seed sent bytes that do not decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The credentials were refused.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// A handshake step answered with a non-success status.
    #[error("{opcode:?} rejected ({status}): {message}")]
    Rejected {
        /// Request that was rejected.
        opcode: Opcode,
        /// Status in the response.
        status: Status,
        /// Server-supplied detail.
        message: String,
    },

    /// A handshake step was answered with the wrong opcode.
    #[error("expected a {expected:?} response, got {got:?}")]
    Unexpected {
        /// Opcode of the awaited response.
        expected: Opcode,
        /// Opcode that arrived.
        got: Opcode,
    },
}

impl HandshakeError {
    /// How this failure is reported in [`ClientError::BootstrapFailed`].
    pub fn seed_failure_kind(&self) -> SeedFailureKind {
        match self {
            HandshakeError::Transport(TransportError::ConnectionTimeout { .. }) => {
                SeedFailureKind::Timeout
            }
            HandshakeError::Transport(TransportError::Protocol(_)) => SeedFailureKind::Protocol,
            HandshakeError::Transport(_) => SeedFailureKind::Network,
            HandshakeError::Authentication(_) => SeedFailureKind::Authentication,
            HandshakeError::Protocol(_)
            | HandshakeError::Rejected { .. }
            | HandshakeError::Unexpected { .. } => SeedFailureKind::Protocol,
        }
    }
}

impl From<HandshakeError> for Fault {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Transport(e) => e.into(),
            HandshakeError::Authentication(message) => Fault::server(Status::AuthFailed, message),
            HandshakeError::Rejected {
                status, message, ..
            } => Fault::server(status, message),
            other => Fault::malformed(other.to_string()),
        }
    }
}

/// Sends one request and waits for its response, skipping server pushes.
async fn round_trip(
    conn: &dyn Connection,
    opcode: Opcode,
    id: u64,
    payload: impl Into<bytes::Bytes>,
) -> std::result::Result<Frame, HandshakeError> {
    conn.send_frame(&Frame::request(opcode, id, payload)).await?;
    loop {
        let frame = conn.recv_frame().await?;
        if frame.is_push() {
            continue;
        }
        if !frame.is_response() || frame.correlation_id() != id || frame.opcode() != opcode {
            return Err(HandshakeError::Unexpected {
                expected: opcode,
                got: frame.opcode(),
            });
        }
        return Ok(frame);
    }
}

/// Runs `Hello` and `Authenticate` on a fresh connection.
pub async fn handshake(
    conn: &dyn Connection,
    client_name: &str,
    credentials: &Credentials,
) -> std::result::Result<HelloResponse, HandshakeError> {
    let hello = HelloRequest {
        client_name: client_name.to_string(),
        features: CLIENT_FEATURES.iter().map(|f| f.to_string()).collect(),
    };
    let response = round_trip(conn, Opcode::Hello, HELLO_ID, encode_body(&hello)?).await?;
    if !response.status().is_success() {
        return Err(HandshakeError::Rejected {
            opcode: Opcode::Hello,
            status: response.status(),
            message: error_message(&response),
        });
    }
    let hello: HelloResponse = decode_body(&response.payload)?;

    let auth = AuthRequest {
        username: credentials.username.clone(),
        password: credentials.password.clone(),
    };
    let response = round_trip(conn, Opcode::Authenticate, AUTH_ID, encode_body(&auth)?).await?;
    match response.status() {
        Status::Success => {}
        Status::AuthFailed | Status::AccessDenied => {
            return Err(HandshakeError::Authentication(error_message(&response)))
        }
        status => {
            return Err(HandshakeError::Rejected {
                opcode: Opcode::Authenticate,
                status,
                message: error_message(&response),
            })
        }
    }

    debug!(
        peer = conn.peer_addr(),
        server_version = %hello.server_version,
        "handshake complete"
    );
    Ok(hello)
}

/// Fetches the cluster map over an authenticated connection.
pub async fn fetch_cluster_map(
    conn: &dyn Connection,
) -> std::result::Result<ClusterMap, HandshakeError> {
    let response = round_trip(conn, Opcode::GetClusterMap, CLUSTER_MAP_ID, Vec::new()).await?;
    if !response.status().is_success() {
        return Err(HandshakeError::Rejected {
            opcode: Opcode::GetClusterMap,
            status: response.status(),
            message: error_message(&response),
        });
    }
    Ok(ClusterMap::from_json(&response.payload)?)
}

/// Result of a successful bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// Map fetched from the seed.
    pub map: ClusterMap,
    /// The seed that answered.
    pub seed: String,
    /// Version string from the seed's `Hello` response.
    pub server_version: String,
}

/// Tries seeds in order until one yields a cluster map.
pub struct Bootstrapper {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    client_name: String,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("client_name", &self.client_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Bootstrapper {
    /// Uses the credentials, client name and connect timeout from `config`.
    pub fn new(transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        Self {
            transport,
            credentials: config.credentials.clone(),
            client_name: config.client_name.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Bootstraps from `seeds` (normalised `host:port` addresses).
    pub async fn run(&self, seeds: &[String]) -> Result<BootstrapOutcome> {
        let mut attempts = Vec::with_capacity(seeds.len());
        for seed in seeds {
            match self.try_seed(seed).await {
                Ok(outcome) => {
                    info!(
                        seed = %seed,
                        revision = outcome.map.revision,
                        nodes = outcome.map.endpoints.len(),
                        skipped = attempts.len(),
                        "bootstrap complete"
                    );
                    return Ok(outcome);
                }
                Err(failure) => {
                    warn!(seed = %seed, kind = %failure.kind, reason = %failure.reason, "bootstrap seed failed");
                    attempts.push(failure);
                }
            }
        }
        Err(ClientError::BootstrapFailed { attempts })
    }

    async fn try_seed(&self, seed: &str) -> std::result::Result<BootstrapOutcome, SeedFailure> {
        let failure = |kind: SeedFailureKind, reason: String| SeedFailure {
            seed: seed.to_string(),
            kind,
            reason,
        };

        let attempt = async {
            let conn = self.transport.connect(seed).await?;
            let hello = handshake(conn.as_ref(), &self.client_name, &self.credentials).await?;
            let map = fetch_cluster_map(conn.as_ref()).await?;
            conn.shutdown().await;
            Ok::<_, HandshakeError>((hello, map))
        };

        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Err(_) => Err(failure(
                SeedFailureKind::Timeout,
                format!("no answer within {}ms", self.connect_timeout.as_millis()),
            )),
            Ok(Err(e)) => Err(failure(e.seed_failure_kind(), e.to_string())),
            Ok(Ok((_, map))) if map.endpoints.is_empty() => Err(failure(
                SeedFailureKind::Protocol,
                format!("cluster map revision {} lists no nodes", map.revision),
            )),
            Ok(Ok((hello, map))) => Ok(BootstrapOutcome {
                map,
                seed: seed.to_string(),
                server_version: hello.server_version,
            }),
        }
    }
}
