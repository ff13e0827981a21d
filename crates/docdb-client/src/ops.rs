//! Key-value operations.
//!
//! An [`Operation`] knows how to encode itself for a bucket and how to turn
//! the response frame into an [`OpResult`]. The session routes it to the node
//! owning its key and applies the deadline.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dispatcher::check_status;
use crate::error::Fault;
use crate::protocol::{decode_body, encode_body, Frame, KvRequest, KvResponse, Opcode, Status};
use crate::result::OpResult;
use crate::topology::Service;

/// A single request against one document.
pub trait Operation: Send + Sync {
    /// Value carried by a successful result.
    type Output: Send;

    /// Opcode the request is sent with.
    fn opcode(&self) -> Opcode;

    /// Document id; also decides which node receives the request.
    fn key(&self) -> &str;

    /// Service the request is routed to.
    fn service(&self) -> Service {
        Service::KeyValue
    }

    /// Serializes the request body for `bucket`.
    fn encode(&self, bucket: &str) -> Result<Bytes, Fault>;

    /// Turns the response frame into the operation's result.
    fn decode(&self, frame: Frame) -> OpResult<Self::Output>;
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document<T> {
    /// Document id.
    pub id: String,
    /// Compare-and-swap value at the time of the read.
    pub cas: u64,
    /// Deserialized JSON content.
    pub content: T,
}

fn kv_body(bucket: &str, key: &str, value: Option<Vec<u8>>, cas: u64, expiry_secs: u32) -> Result<Bytes, Fault> {
    let request = KvRequest {
        bucket: bucket.to_string(),
        key: key.to_string(),
        value,
        cas,
        expiry_secs,
    };
    encode_body(&request).map_err(|e| Fault::invalid_argument(e.to_string()))
}

fn kv_response(frame: Frame) -> Result<KvResponse, Fault> {
    let frame = check_status(frame)?;
    decode_body(&frame.payload).map_err(Fault::from)
}

/// Reads a document and deserializes its JSON content into `T`.
#[derive(Debug, Clone)]
pub struct Get<T> {
    id: String,
    _content: PhantomData<fn() -> T>,
}

impl<T> Get<T> {
    /// Reads the document `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _content: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Send> Operation for Get<T> {
    type Output = Document<T>;

    fn opcode(&self) -> Opcode {
        Opcode::Get
    }

    fn key(&self) -> &str {
        &self.id
    }

    fn encode(&self, bucket: &str) -> Result<Bytes, Fault> {
        kv_body(bucket, &self.id, None, 0, 0)
    }

    fn decode(&self, frame: Frame) -> OpResult<Document<T>> {
        let response = match kv_response(frame) {
            Ok(response) => response,
            Err(fault) => return OpResult::failed(fault),
        };
        let Some(raw) = response.value else {
            return OpResult::failed(Fault::malformed(format!("get {} returned no content", self.id)));
        };
        match serde_json::from_slice(&raw) {
            Ok(content) => OpResult::ok(Document {
                id: self.id.clone(),
                cas: response.cas,
                content,
            })
            .with_cas(response.cas),
            Err(e) => OpResult::failed(Fault::malformed(format!(
                "document {} is not valid for the requested type: {e}",
                self.id
            ))),
        }
    }
}

/// Checks whether a document exists. A missing document is a successful `false`.
#[derive(Debug, Clone)]
pub struct Exists {
    id: String,
}

impl Exists {
    /// Checks whether the document `id` exists.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Operation for Exists {
    type Output = bool;

    fn opcode(&self) -> Opcode {
        Opcode::Exists
    }

    fn key(&self) -> &str {
        &self.id
    }

    fn encode(&self, bucket: &str) -> Result<Bytes, Fault> {
        kv_body(bucket, &self.id, None, 0, 0)
    }

    fn decode(&self, frame: Frame) -> OpResult<bool> {
        if frame.status() == Status::KeyNotFound {
            return OpResult::ok(false);
        }
        match kv_response(frame) {
            Ok(response) => OpResult::ok(true).with_cas(response.cas),
            Err(fault) => OpResult::failed(fault),
        }
    }
}

/// Writes, replaces, removes or touches one document.
#[derive(Debug, Clone)]
pub struct Mutation {
    opcode: Opcode,
    id: String,
    content: Option<Result<Vec<u8>, String>>,
    cas: u64,
    expiry_secs: u32,
}

impl Mutation {
    fn new(opcode: Opcode, id: impl Into<String>) -> Self {
        Self {
            opcode,
            id: id.into(),
            content: None,
            cas: 0,
            expiry_secs: 0,
        }
    }

    fn with_content<T: Serialize + ?Sized>(mut self, content: &T) -> Self {
        self.content = Some(serde_json::to_vec(content).map_err(|e| e.to_string()));
        self
    }

    /// Creates or overwrites a document.
    pub fn upsert<T: Serialize + ?Sized>(id: impl Into<String>, content: &T) -> Self {
        Self::new(Opcode::Upsert, id).with_content(content)
    }

    /// Creates a document; fails with `KeyExists` if it already exists.
    pub fn insert<T: Serialize + ?Sized>(id: impl Into<String>, content: &T) -> Self {
        Self::new(Opcode::Insert, id).with_content(content)
    }

    /// Overwrites an existing document; fails with `KeyNotFound` if it does not exist.
    pub fn replace<T: Serialize + ?Sized>(id: impl Into<String>, content: &T) -> Self {
        Self::new(Opcode::Replace, id).with_content(content)
    }

    /// Deletes a document.
    pub fn remove(id: impl Into<String>) -> Self {
        Self::new(Opcode::Remove, id)
    }

    /// Resets a document's expiry without changing its content.
    pub fn touch(id: impl Into<String>, expiry_secs: u32) -> Self {
        Self::new(Opcode::Touch, id).with_expiry(expiry_secs)
    }

    /// Applies only if the document's current cas matches.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Expiry in seconds applied by the mutation; 0 keeps the document forever.
    pub fn with_expiry(mut self, expiry_secs: u32) -> Self {
        self.expiry_secs = expiry_secs;
        self
    }
}

impl Operation for Mutation {
    type Output = ();

    fn opcode(&self) -> Opcode {
        self.opcode
    }

    fn key(&self) -> &str {
        &self.id
    }

    fn encode(&self, bucket: &str) -> Result<Bytes, Fault> {
        let value = match &self.content {
            Some(Ok(bytes)) => Some(bytes.clone()),
            Some(Err(e)) => {
                return Err(Fault::invalid_argument(format!(
                    "document {} cannot be serialized: {e}",
                    self.id
                )))
            }
            None => None,
        };
        kv_body(bucket, &self.id, value, self.cas, self.expiry_secs)
    }

    fn decode(&self, frame: Frame) -> OpResult<()> {
        match kv_response(frame) {
            Ok(response) => OpResult::done().with_cas(response.cas),
            Err(fault) => OpResult::failed(fault),
        }
    }
}
