//! In-process mock cluster speaking the client's wire protocol over TCP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docdb_client::protocol::{
    decode_body, encode_body, AuthRequest, ErrorBody, Frame, HelloResponse, KvRequest, KvResponse,
    Opcode, Status,
};
use docdb_client::query::{QueryBody, QueryHeader, QueryMeta, QueryMetrics, QueryProblem, QueryStatus};
use docdb_client::topology::{ClusterMap, Endpoint, Service};
use docdb_client::transport::{Connection, FramedConnection};
use docdb_client::{ClientConfig, Credentials, PoolConfig};
use tokio::net::{TcpListener, TcpStream};

pub const USERNAME: &str = "app";
pub const PASSWORD: &str = "secret";
pub const SERVER_VERSION: &str = "7.6.0-mock";

/// Statement that makes the mock answer a query with an error in its metadata.
pub const FAILING_STATEMENT: &str = "SELECT * FROM missing_index";

type Conn = Arc<FramedConnection<TcpStream>>;

/// State shared by every node of one mock cluster.
#[derive(Default)]
pub struct ClusterState {
    pub map: Mutex<ClusterMap>,
    docs: Mutex<HashMap<(String, String), (Vec<u8>, u64)>>,
    next_cas: AtomicU64,
    /// Milliseconds each key-value answer is held back.
    pub kv_delay_ms: AtomicU64,
    /// Close the connection instead of answering key-value requests.
    pub drop_on_kv: AtomicBool,
    conns: Mutex<Vec<Conn>>,
    pub queries: Mutex<Vec<QueryBody>>,
}

impl ClusterState {
    fn bump_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_kv_delay(&self, delay: Duration) {
        self.kv_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sends a cluster map push on every open connection.
    pub async fn push_map(&self, map: &ClusterMap) {
        let payload = map.to_json().unwrap();
        let conns: Vec<Conn> = self.conns.lock().unwrap().clone();
        for conn in conns {
            let _ = conn
                .send_frame(&Frame::push(Opcode::ClusterMapPush, payload.clone()))
                .await;
        }
    }

    pub fn document_count(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

/// A running mock cluster.
pub struct MockCluster {
    pub addrs: Vec<String>,
    pub state: Arc<ClusterState>,
}

impl MockCluster {
    /// Starts `nodes` listening nodes that all serve the same map and documents.
    pub async fn start(nodes: usize) -> Self {
        let state = Arc::new(ClusterState::default());
        let mut listeners = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().to_string())
            .collect();
        *state.map.lock().unwrap() = map_for(1, &addrs);

        for listener in listeners {
            tokio::spawn(accept_loop(listener, state.clone()));
        }
        Self { addrs, state }
    }

    /// Starts one more node sharing this cluster's state; it is not in the map yet.
    pub async fn add_node(&mut self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(accept_loop(listener, self.state.clone()));
        self.addrs.push(addr.clone());
        addr
    }

    pub fn config(&self) -> ClientConfig {
        config_for(self.addrs.clone())
    }
}

/// Client configuration pointing at `seeds` with the mock's credentials.
pub fn config_for(seeds: Vec<String>) -> ClientConfig {
    let mut config = ClientConfig::new(seeds, Credentials::new(USERNAME, PASSWORD), "travel");
    config.pool = PoolConfig {
        min_per_node: 1,
        max_per_node: 4,
        max_requests_per_connection: 16,
        idle_timeout_ms: 60_000,
    };
    config.connect_timeout_ms = 2_000;
    config.close_grace_ms = 2_000;
    config
}

/// A map listing `addrs` as key-value and query nodes.
pub fn map_for(revision: u64, addrs: &[String]) -> ClusterMap {
    ClusterMap {
        revision,
        endpoints: addrs
            .iter()
            .map(|addr| {
                let (host, port) = addr.rsplit_once(':').unwrap();
                Endpoint::new(host, port.parse().unwrap(), &[Service::KeyValue, Service::Query])
            })
            .collect(),
        partitions: vec![],
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn accept_loop(listener: TcpListener, state: Arc<ClusterState>) {
    while let Ok((stream, peer)) = listener.accept().await {
        let conn: Conn = Arc::new(FramedConnection::new(stream, peer.to_string()));
        state.conns.lock().unwrap().push(conn.clone());
        tokio::spawn(serve(conn, state.clone()));
    }
}

fn error(frame: &Frame, status: Status, message: &str) -> Frame {
    let body = encode_body(&ErrorBody {
        message: message.to_string(),
    })
    .unwrap();
    frame.make_response(status, body)
}

fn kv(frame: &Frame, value: Option<Vec<u8>>, cas: u64) -> Frame {
    frame.make_response(Status::Success, encode_body(&KvResponse { value, cas }).unwrap())
}

async fn serve(conn: Conn, state: Arc<ClusterState>) {
    while let Ok(frame) = conn.recv_frame().await {
        let response = match frame.opcode() {
            Opcode::Hello => frame.make_response(
                Status::Success,
                encode_body(&HelloResponse {
                    server_version: SERVER_VERSION.to_string(),
                    features: vec!["json".to_string()],
                })
                .unwrap(),
            ),
            Opcode::Authenticate => {
                let auth: AuthRequest = decode_body(&frame.payload).unwrap();
                if auth.username == USERNAME && auth.password == PASSWORD {
                    frame.make_response(Status::Success, Vec::new())
                } else {
                    error(&frame, Status::AuthFailed, "invalid username or password")
                }
            }
            Opcode::GetClusterMap => {
                let map = state.map.lock().unwrap().to_json().unwrap();
                frame.make_response(Status::Success, map)
            }
            Opcode::Noop => frame.make_response(Status::Success, Vec::new()),
            Opcode::Query => {
                tokio::spawn(answer_query(conn.clone(), state.clone(), frame));
                continue;
            }
            _ => {
                if state.drop_on_kv.load(Ordering::SeqCst) {
                    conn.shutdown().await;
                    return;
                }
                let delay = state.kv_delay_ms.load(Ordering::SeqCst);
                let response = handle_kv(&state, &frame);
                if delay > 0 {
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let _ = conn.send_frame(&response).await;
                    });
                    continue;
                }
                response
            }
        };
        if conn.send_frame(&response).await.is_err() {
            return;
        }
    }
}

fn handle_kv(state: &ClusterState, frame: &Frame) -> Frame {
    let req: KvRequest = match decode_body(&frame.payload) {
        Ok(req) => req,
        Err(e) => return error(frame, Status::InvalidRequest, &e.to_string()),
    };
    let mut docs = state.docs.lock().unwrap();
    let key = (req.bucket.clone(), req.key.clone());
    let current = docs.get(&key).cloned();
    let not_found = |frame: &Frame| error(frame, Status::KeyNotFound, &format!("document {} not found", req.key));
    let cas_ok = |cur: u64| req.cas == 0 || req.cas == cur;

    match frame.opcode() {
        Opcode::Get => match current {
            Some((value, cas)) => kv(frame, Some(value), cas),
            None => not_found(frame),
        },
        Opcode::Exists => match current {
            Some((_, cas)) => kv(frame, None, cas),
            None => not_found(frame),
        },
        Opcode::Upsert => {
            let cas = state.bump_cas();
            docs.insert(key, (req.value.clone().unwrap_or_default(), cas));
            kv(frame, None, cas)
        }
        Opcode::Insert => match current {
            Some(_) => error(frame, Status::KeyExists, "document already exists"),
            None => {
                let cas = state.bump_cas();
                docs.insert(key, (req.value.clone().unwrap_or_default(), cas));
                kv(frame, None, cas)
            }
        },
        Opcode::Replace => match current {
            None => not_found(frame),
            Some((_, cur)) if !cas_ok(cur) => error(frame, Status::CasMismatch, "cas mismatch"),
            Some(_) => {
                let cas = state.bump_cas();
                docs.insert(key, (req.value.clone().unwrap_or_default(), cas));
                kv(frame, None, cas)
            }
        },
        Opcode::Remove => match current {
            None => not_found(frame),
            Some((_, cur)) if !cas_ok(cur) => error(frame, Status::CasMismatch, "cas mismatch"),
            Some(_) => {
                docs.remove(&key);
                kv(frame, None, state.bump_cas())
            }
        },
        Opcode::Touch => match current {
            None => not_found(frame),
            Some((value, _)) => {
                let cas = state.bump_cas();
                docs.insert(key, (value, cas));
                kv(frame, None, cas)
            }
        },
        _ => error(frame, Status::InvalidRequest, "unsupported opcode"),
    }
}

/// Streams `positional[0]` rows of `{"n": i}` (default 3), then the metadata.
async fn answer_query(conn: Conn, state: Arc<ClusterState>, frame: Frame) {
    let body: QueryBody = match serde_json::from_slice(&frame.payload) {
        Ok(body) => body,
        Err(e) => {
            let _ = conn.send_frame(&error(&frame, Status::InvalidRequest, &e.to_string())).await;
            return;
        }
    };
    state.queries.lock().unwrap().push(body.clone());

    let header = QueryHeader {
        request_id: format!("req-{}", frame.correlation_id()),
        client_context_id: body.request.client_context_id.clone(),
        signature: None,
    };
    let header = frame.make_response_as(Opcode::QueryHeader, Status::Success, serde_json::to_vec(&header).unwrap());
    if conn.send_frame(&header).await.is_err() {
        return;
    }

    if body.request.statement == FAILING_STATEMENT {
        let meta = QueryMeta {
            status: QueryStatus::Errors,
            errors: vec![QueryProblem {
                code: 4000,
                message: "no index available on keyspace missing_index".to_string(),
            }],
            ..QueryMeta::default()
        };
        let end = frame.make_response_as(Opcode::QueryEnd, Status::Success, serde_json::to_vec(&meta).unwrap());
        let _ = conn.send_frame(&end).await;
        return;
    }

    let rows = body
        .request
        .positional
        .first()
        .and_then(|v| v.as_u64())
        .unwrap_or(3);
    for n in 0..rows {
        let row = frame.make_response_as(Opcode::QueryRow, Status::Success, format!(r#"{{"n":{n}}}"#).into_bytes());
        if conn.send_frame(&row).await.is_err() {
            return;
        }
    }
    let meta = QueryMeta {
        status: QueryStatus::Success,
        metrics: QueryMetrics {
            result_count: rows,
            ..QueryMetrics::default()
        },
        ..QueryMeta::default()
    };
    let end = frame.make_response_as(Opcode::QueryEnd, Status::Success, serde_json::to_vec(&meta).unwrap());
    let _ = conn.send_frame(&end).await;
}
