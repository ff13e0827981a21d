//! Query requests and their streamed results.
//!
//! A query is answered by a `QueryHeader` frame, zero or more `QueryRow`
//! frames carrying one JSON row each, and a closing `QueryEnd` frame with the
//! execution metadata. Rows are surfaced through a [`RowStream`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::Fault;
use crate::metrics::ClientMetrics;
use crate::protocol::{error_message, Opcode};
use crate::streaming::RowStream;
use crate::topology::{NodeRegistry, Service};

/// Consistency required of the indexes a query reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanConsistency {
    /// Return whatever the indexes hold now.
    #[default]
    NotBounded,
    /// Wait until the indexes include every mutation made before the query.
    RequestPlus,
}

/// A query statement and its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Statement text with `$1` or `$name` placeholders.
    pub statement: String,
    /// Values for `$1`, `$2`, ...
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,
    /// Values for `$name` placeholders, keyed with the `$`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub named: BTreeMap<String, Value>,
    /// How fresh the indexes must be before the query runs.
    #[serde(default)]
    pub scan_consistency: ScanConsistency,
    /// Echoed back by the server; identifies the request in server logs.
    pub client_context_id: String,
    /// Ad hoc statements are not prepared and cached by the server.
    #[serde(default = "default_adhoc")]
    pub adhoc: bool,
    /// Overrides the session's query timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_adhoc() -> bool {
    true
}

impl QueryRequest {
    /// A statement with no parameters, `NotBounded` consistency and a fresh context id.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            positional: Vec::new(),
            named: BTreeMap::new(),
            scan_consistency: ScanConsistency::NotBounded,
            client_context_id: uuid::Uuid::new_v4().to_string(),
            adhoc: true,
            timeout_ms: None,
        }
    }

    /// Binds the next `$n` placeholder.
    pub fn positional(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Binds a `$name` placeholder. The leading `$` is optional.
    pub fn named(mut self, name: &str, value: impl Into<Value>) -> Self {
        let name = if name.starts_with('$') {
            name.to_string()
        } else {
            format!("${name}")
        };
        self.named.insert(name, value.into());
        self
    }

    /// Sets the scan consistency.
    pub fn scan_consistency(mut self, consistency: ScanConsistency) -> Self {
        self.scan_consistency = consistency;
        self
    }

    /// Replaces the generated context id.
    pub fn client_context_id(mut self, id: impl Into<String>) -> Self {
        self.client_context_id = id.into();
        self
    }

    /// Marks the statement as ad hoc or preparable.
    pub fn adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }

    /// Bounds the whole response, header through metadata.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Request body sent with `Opcode::Query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryBody {
    /// Bucket the query runs against.
    pub bucket: String,
    /// Statement and options, flattened into the body.
    #[serde(flatten)]
    pub request: QueryRequest,
}

/// First frame of a query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryHeader {
    /// Server-assigned id of this execution.
    pub request_id: String,
    /// Echo of [`QueryRequest::client_context_id`].
    #[serde(default)]
    pub client_context_id: String,
    /// Shape of the result rows, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Value>,
}

/// Execution metrics reported at the end of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMetrics {
    /// Wall time on the server, including queueing.
    pub elapsed_ms: u64,
    /// Time spent executing, excluding queueing.
    pub execution_ms: u64,
    /// Rows returned.
    pub result_count: u64,
    /// Bytes of result rows.
    pub result_size: u64,
    /// Entries in [`QueryMeta::errors`].
    pub error_count: u64,
    /// Entries in [`QueryMeta::warnings`].
    pub warning_count: u64,
}

/// An error or warning reported by the query service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProblem {
    /// Query service error code.
    pub code: u32,
    /// Message from the query service.
    pub message: String,
}

/// Query completion status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// All rows were returned.
    #[default]
    Success,
    /// The query failed; see [`QueryMeta::errors`].
    Errors,
    /// The server-side timeout elapsed.
    Timeout,
    /// The query was stopped on the server.
    Stopped,
    /// The server failed while running the query.
    Fatal,
}

/// Last frame of a query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMeta {
    /// How the query finished.
    pub status: QueryStatus,
    /// Execution counters.
    pub metrics: QueryMetrics,
    /// Errors reported by the query service.
    pub errors: Vec<QueryProblem>,
    /// Warnings that did not stop the query.
    pub warnings: Vec<QueryProblem>,
}

impl QueryMeta {
    /// First reported error, formatted for a fault message.
    pub fn error_summary(&self) -> String {
        match self.errors.first() {
            Some(problem) => format!("[{}] {}", problem.code, problem.message),
            None => format!("query finished with status {:?}", self.status),
        }
    }
}

/// A running query: its header and the lazily read rows.
#[derive(Debug)]
pub struct QueryResult<T> {
    /// Header sent before the first row.
    pub header: QueryHeader,
    /// Rows in server order. Dropping the stream early releases the connection.
    pub rows: RowStream<T>,
}

/// Sends `request` to a query node and waits for the response header.
///
/// `force` ends the returned row stream early when the session closes.
pub(crate) async fn start<T: DeserializeOwned>(
    dispatcher: &Dispatcher,
    registry: &NodeRegistry,
    metrics: Arc<ClientMetrics>,
    bucket: &str,
    request: QueryRequest,
    deadline: Instant,
    force: CancellationToken,
) -> Result<QueryResult<T>, Fault> {
    let node = registry.node_for_service(Service::Query)?;
    let body = QueryBody {
        bucket: bucket.to_string(),
        request,
    };
    let payload = serde_json::to_vec(&body)
        .map_err(|e| Fault::invalid_argument(format!("query cannot be encoded: {e}")))?;

    let mut handle = dispatcher
        .open_stream(&node, Opcode::Query, payload.into(), deadline)
        .await?;

    let first = match tokio::time::timeout_at(deadline, handle.frames.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            return Err(Fault::connection_lost(format!(
                "connection to {node} closed before the query answered"
            )))
        }
        Err(_) => {
            metrics.inc_timeouts();
            return Err(Fault::timeout(format!(
                "query {} got no response from {node} before its deadline",
                body.request.client_context_id
            )));
        }
    };

    if !first.status().is_success() {
        return Err(Fault::server(first.status(), error_message(&first)));
    }
    if first.opcode() != Opcode::QueryHeader {
        return Err(Fault::malformed(format!(
            "query response started with {:?} instead of a header",
            first.opcode()
        )));
    }
    let header: QueryHeader = serde_json::from_slice(&first.payload)
        .map_err(|e| Fault::malformed(format!("query header: {e}")))?;

    Ok(QueryResult {
        header,
        rows: RowStream::new(handle, deadline, metrics, force),
    })
}
