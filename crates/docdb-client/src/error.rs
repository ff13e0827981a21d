//! Error types for the client.
//!
//! Two families of failure:
//! - [`ClientError`] is raised (returned as `Err`) and unwinds the caller: bootstrap
//!   failure, use-after-close, invalid configuration.
//! - [`Fault`] is operation-scoped and travels inside [`crate::result::OpResult`]:
//!   timeouts, pool exhaustion, lost connections, malformed or failed responses.

use std::fmt;

use thiserror::Error;

use crate::protocol::Status;

/// Wire codec failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame does not start with the protocol magic.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// The protocol magic.
        expected: u32,
        /// What the frame carried.
        got: u32,
    },

    /// The peer speaks another protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this client speaks.
        expected: u8,
        /// Version in the frame.
        got: u8,
    },

    /// The opcode field holds no known value.
    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// Declared payload exceeds the frame size limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u32,
        /// Largest accepted payload.
        max_size: u32,
    },

    /// The buffer ended inside a frame.
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes available.
        got: usize,
    },

    /// A bincode or JSON body did not decode.
    #[error("body codec error: {0}")]
    Body(String),
}

/// Failures of a single transport connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connect did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address being dialled.
        addr: String,
        /// Connect timeout that elapsed.
        timeout_ms: u64,
    },

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// The TLS handshake with the node failed.
    #[error("TLS handshake failed: {reason}")]
    Tls {
        /// Error reported by rustls.
        reason: String,
    },

    /// A frame arrived that does not decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Classification of an operation-scoped failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The deadline elapsed before a response arrived.
    Timeout,
    /// No pooled connection became available before the deadline.
    PoolExhausted,
    /// The connection carrying the request closed before it completed.
    ConnectionLost,
    /// The response could not be decoded.
    MalformedResponse,
    /// The server answered with a non-success status.
    Server(Status),
    /// The session is closing or closed.
    SessionClosed,
    /// The caller cancelled the operation.
    Cancelled,
    /// No node in the current cluster map can serve the request.
    NoAvailableNode,
    /// The request could not be encoded.
    InvalidArgument,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::PoolExhausted => write!(f, "pool exhausted"),
            FaultKind::ConnectionLost => write!(f, "connection lost"),
            FaultKind::MalformedResponse => write!(f, "malformed response"),
            FaultKind::Server(status) => write!(f, "server error ({status})"),
            FaultKind::SessionClosed => write!(f, "session closed"),
            FaultKind::Cancelled => write!(f, "cancelled"),
            FaultKind::NoAvailableNode => write!(f, "no available node"),
            FaultKind::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Operation-scoped failure, returned as data rather than raised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Fault {
    /// What went wrong.
    pub kind: FaultKind,
    /// Human-readable detail.
    pub message: String,
}

impl Fault {
    /// Creates a fault of the given kind.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A [`FaultKind::Timeout`] fault.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    /// A [`FaultKind::PoolExhausted`] fault.
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::new(FaultKind::PoolExhausted, message)
    }

    /// A [`FaultKind::ConnectionLost`] fault.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ConnectionLost, message)
    }

    /// A [`FaultKind::MalformedResponse`] fault.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::MalformedResponse, message)
    }

    /// A non-success status from the server.
    pub fn server(status: Status, message: impl Into<String>) -> Self {
        Self::new(FaultKind::Server(status), message)
    }

    /// A [`FaultKind::SessionClosed`] fault.
    pub fn session_closed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::SessionClosed, message)
    }

    /// A [`FaultKind::Cancelled`] fault.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Cancelled, message)
    }

    /// A [`FaultKind::NoAvailableNode`] fault.
    pub fn no_available_node(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NoAvailableNode, message)
    }

    /// A [`FaultKind::InvalidArgument`] fault.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidArgument, message)
    }

    /// Returns true if repeating the same operation later may succeed.
    ///
    /// The client never retries on its own; this is the hint callers use to
    /// decide whether to retry, log, or abort.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FaultKind::Timeout
            | FaultKind::PoolExhausted
            | FaultKind::ConnectionLost
            | FaultKind::NoAvailableNode => true,
            FaultKind::Server(status) => status.is_transient(),
            FaultKind::MalformedResponse
            | FaultKind::SessionClosed
            | FaultKind::Cancelled
            | FaultKind::InvalidArgument => false,
        }
    }
}

impl From<TransportError> for Fault {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionTimeout { .. } => Fault::timeout(err.to_string()),
            TransportError::Protocol(_) => Fault::malformed(err.to_string()),
            TransportError::Closed | TransportError::Tls { .. } | TransportError::Io(_) => {
                Fault::connection_lost(err.to_string())
            }
        }
    }
}

impl From<ProtocolError> for Fault {
    fn from(err: ProtocolError) -> Self {
        Fault::malformed(err.to_string())
    }
}

/// Why a single seed failed during bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedFailureKind {
    /// The seed could not be reached or the connection dropped.
    Network,
    /// The seed rejected the credentials.
    Authentication,
    /// The seed answered with something the client could not understand.
    Protocol,
    /// The seed did not answer before the connect timeout.
    Timeout,
}

impl fmt::Display for SeedFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedFailureKind::Network => write!(f, "network"),
            SeedFailureKind::Authentication => write!(f, "authentication"),
            SeedFailureKind::Protocol => write!(f, "protocol"),
            SeedFailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// One seed's bootstrap failure, reported in seed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedFailure {
    /// Seed as configured or resolved, in `host:port` form.
    pub seed: String,
    /// Which stage of the handshake failed.
    pub kind: SeedFailureKind,
    /// Detail from the transport or the server.
    pub reason: String,
}

impl fmt::Display for SeedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.seed, self.kind, self.reason)
    }
}

fn summarize(attempts: &[SeedFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Non-recoverable client failures. These are always raised.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every seed failed; attempts are listed in the order they were tried.
    #[error("bootstrap failed against {} seed(s): {}", attempts.len(), summarize(attempts))]
    BootstrapFailed {
        /// One entry per seed tried.
        attempts: Vec<SeedFailure>,
    },

    /// The session or cluster was closed before the call.
    #[error("session already closed")]
    SessionClosed,

    /// The configuration was rejected before any connection was made.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// The first problem found.
        reason: String,
    },

    /// The TLS client configuration could not be built.
    #[error("TLS setup failed: {reason}")]
    Tls {
        /// Why the certificates or client config were rejected.
        reason: String,
    },

    /// DNS seed discovery found nothing and no seeds were configured.
    #[error("no seeds resolved from DNS SRV record {name}: {reason}")]
    SeedResolution {
        /// SRV record that was looked up.
        name: String,
        /// Resolver error, or why the answer was unusable.
        reason: String,
    },
}

impl ClientError {
    /// Returns true if bootstrap failed and at least one seed rejected the credentials.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            ClientError::BootstrapFailed { attempts } => attempts
                .iter()
                .any(|a| a.kind == SeedFailureKind::Authentication),
            _ => false,
        }
    }
}

/// Result alias for client-level failures.
pub type Result<T> = std::result::Result<T, ClientError>;
