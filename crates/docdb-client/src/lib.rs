#![warn(missing_docs)]

//! Document database client: cluster bootstrap, pooled multiplexed request dispatch,
//! bucket sessions and streaming query results

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod result;
pub mod session;
pub mod streaming;
pub mod tcp;
pub mod tls;
pub mod topology;
pub mod transport;

pub use config::{ClientConfig, Credentials, NetworkMode, PoolConfig, ServiceTimeouts, TlsSettings};
pub use error::{ClientError, Fault, FaultKind, Result, SeedFailure, SeedFailureKind};
pub use ops::{Document, Exists, Get, Mutation, Operation};
pub use query::{QueryMeta, QueryRequest, QueryResult, ScanConsistency};
pub use result::OpResult;
pub use session::{Cluster, OpOptions, Session, SessionState};
pub use streaming::RowStream;
