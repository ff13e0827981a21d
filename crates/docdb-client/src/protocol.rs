//! Binary frame protocol spoken between the client and data nodes.
//!
//! Every message is a frame with a fixed 24-byte big-endian header followed by
//! an opaque payload. The header carries the correlation id used to match
//! responses to requests and a flags byte that tells requests, responses and
//! server pushes apart.
//!
//! ```text
//! magic:4 | version:1 | flags:1 | opcode:2 | correlation_id:8 | status:2 | reserved:2 | payload_length:4
//! ```
//!
//! Request and response bodies are bincode-encoded structs. Documents, cluster
//! maps and query rows are JSON inside those bodies or directly as payload.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0xDBC1_0001;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a peer may send (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Operations understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Feature negotiation, first frame on every connection.
    Hello = 0x0001,
    /// Credential check, second frame on every connection.
    Authenticate = 0x0002,
    /// Fetch the authoritative cluster map.
    GetClusterMap = 0x0003,
    /// Server-initiated cluster map update.
    ClusterMapPush = 0x0004,
    /// Liveness check.
    Noop = 0x0005,
    /// Read a document.
    Get = 0x0010,
    /// Create or overwrite a document.
    Upsert = 0x0011,
    /// Create a document; fails if it exists.
    Insert = 0x0012,
    /// Overwrite an existing document.
    Replace = 0x0013,
    /// Delete a document.
    Remove = 0x0014,
    /// Reset a document's expiry.
    Touch = 0x0015,
    /// Check whether a document exists.
    Exists = 0x0016,
    /// Query request; answered by a header, rows, then an end frame.
    Query = 0x0020,
    /// First response frame of a query.
    QueryHeader = 0x0021,
    /// One result row.
    QueryRow = 0x0022,
    /// Metadata closing a query response.
    QueryEnd = 0x0023,
}

impl TryFrom<u16> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let op = match value {
            0x0001 => Opcode::Hello,
            0x0002 => Opcode::Authenticate,
            0x0003 => Opcode::GetClusterMap,
            0x0004 => Opcode::ClusterMapPush,
            0x0005 => Opcode::Noop,
            0x0010 => Opcode::Get,
            0x0011 => Opcode::Upsert,
            0x0012 => Opcode::Insert,
            0x0013 => Opcode::Replace,
            0x0014 => Opcode::Remove,
            0x0015 => Opcode::Touch,
            0x0016 => Opcode::Exists,
            0x0020 => Opcode::Query,
            0x0021 => Opcode::QueryHeader,
            0x0022 => Opcode::QueryRow,
            0x0023 => Opcode::QueryEnd,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

/// Response status reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The request succeeded.
    Success,
    /// No document with that id.
    KeyNotFound,
    /// A document with that id already exists.
    KeyExists,
    /// The document changed since the supplied cas was read.
    CasMismatch,
    /// Credentials were rejected.
    AuthFailed,
    /// The user may not access the bucket.
    AccessDenied,
    /// Retry later; the node is busy or rebalancing.
    TemporaryFailure,
    /// The server could not parse the request.
    InvalidRequest,
    /// The query service reported an error.
    QueryError,
    /// The server hit an unexpected error.
    InternalError,
    /// A status code this client does not know.
    Unknown(u16),
}

impl Status {
    /// Wire code of this status.
    pub fn as_u16(&self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::CasMismatch => 0x0003,
            Status::AuthFailed => 0x0020,
            Status::AccessDenied => 0x0024,
            Status::TemporaryFailure => 0x0086,
            Status::InvalidRequest => 0x0004,
            Status::QueryError => 0x0050,
            Status::InternalError => 0x0084,
            Status::Unknown(code) => *code,
        }
    }

    /// Unknown codes map to [`Status::Unknown`].
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::CasMismatch,
            0x0020 => Status::AuthFailed,
            0x0024 => Status::AccessDenied,
            0x0086 => Status::TemporaryFailure,
            0x0004 => Status::InvalidRequest,
            0x0050 => Status::QueryError,
            0x0084 => Status::InternalError,
            other => Status::Unknown(other),
        }
    }

    /// True only for [`Status::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// Statuses the server uses for conditions that clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Status::TemporaryFailure)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::CasMismatch => write!(f, "cas mismatch"),
            Status::AuthFailed => write!(f, "authentication failed"),
            Status::AccessDenied => write!(f, "access denied"),
            Status::TemporaryFailure => write!(f, "temporary failure"),
            Status::InvalidRequest => write!(f, "invalid request"),
            Status::QueryError => write!(f, "query error"),
            Status::InternalError => write!(f, "internal error"),
            Status::Unknown(code) => write!(f, "unknown status 0x{code:04X}"),
        }
    }
}

/// Frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set: a client request.
    pub const REQUEST: FrameFlags = FrameFlags(0x00);
    /// Frame answers a request carrying the same correlation id.
    pub const RESPONSE: FrameFlags = FrameFlags(0x01);
    /// Frame was initiated by the server.
    pub const PUSH: FrameFlags = FrameFlags(0x02);

    /// Raw flag bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Wraps raw bits; unknown bits are kept.
    pub fn from_bits(bits: u8) -> Self {
        FrameFlags(bits)
    }

    /// True if every bit of `other` is set.
    pub fn contains(&self, other: FrameFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Direction of the frame.
    pub flags: FrameFlags,
    /// What the frame carries.
    pub opcode: Opcode,
    /// Correlation id for multiplexing.
    pub correlation_id: u64,
    /// Success for requests, the outcome for responses.
    pub status: Status,
    /// Length of the payload that follows the header.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encodes the header into its 24-byte wire form.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.opcode as u16);
        buf.put_u64(self.correlation_id);
        buf.put_u16(self.status.as_u16());
        buf.put_u16(0);
        buf.put_u32(self.payload_length);
    }

    /// Decodes and validates a header.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: FRAME_HEADER_SIZE,
                got: buf.len(),
            });
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_bits(buf.get_u8());
        let opcode = Opcode::try_from(buf.get_u16())?;
        let correlation_id = buf.get_u64();
        let status = Status::from_u16(buf.get_u16());
        let _reserved = buf.get_u16();
        let payload_length = buf.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            flags,
            opcode,
            correlation_id,
            status,
            payload_length,
        })
    }
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded fixed-size header.
    pub header: FrameHeader,
    /// Body bytes, `payload_length` long.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a request frame.
    pub fn request(opcode: Opcode, correlation_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::with_flags(FrameFlags::REQUEST, opcode, correlation_id, Status::Success, payload)
    }

    /// Creates a server push frame. Pushes carry correlation id 0.
    pub fn push(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self::with_flags(FrameFlags::PUSH, opcode, 0, Status::Success, payload)
    }

    fn with_flags(
        flags: FrameFlags,
        opcode: Opcode,
        correlation_id: u64,
        status: Status,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                flags,
                opcode,
                correlation_id,
                status,
                payload_length: payload.len() as u32,
            },
            payload,
        }
    }

    /// Builds a response to this frame with the given status and payload.
    pub fn make_response(&self, status: Status, payload: impl Into<Bytes>) -> Frame {
        Self::with_flags(
            FrameFlags::RESPONSE,
            self.header.opcode,
            self.header.correlation_id,
            status,
            payload,
        )
    }

    /// Builds a response frame with a different opcode, used for multi-frame answers.
    pub fn make_response_as(&self, opcode: Opcode, status: Status, payload: impl Into<Bytes>) -> Frame {
        Self::with_flags(
            FrameFlags::RESPONSE,
            opcode,
            self.header.correlation_id,
            status,
            payload,
        )
    }

    /// Opcode from the header.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Correlation id from the header.
    pub fn correlation_id(&self) -> u64 {
        self.header.correlation_id
    }

    /// Status from the header.
    pub fn status(&self) -> Status {
        self.header.status
    }

    /// True if the frame answers a request.
    pub fn is_response(&self) -> bool {
        self.header.flags.contains(FrameFlags::RESPONSE)
    }

    /// True if the server sent the frame unprompted.
    pub fn is_push(&self) -> bool {
        self.header.flags.contains(FrameFlags::PUSH)
    }

    /// Encodes header and payload into a contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a complete frame from a buffer holding header and payload.
    pub fn decode(buf: &[u8]) -> Result<Frame, ProtocolError> {
        let header = FrameHeader::decode(buf)?;
        let total = FRAME_HEADER_SIZE + header.payload_length as usize;
        if buf.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total,
                got: buf.len(),
            });
        }
        Ok(Frame {
            header,
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]),
        })
    }
}

/// Encodes a request or response body.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Bytes, ProtocolError> {
    bincode::serialize(body)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Body(e.to_string()))
}

/// Decodes a request or response body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::Body(e.to_string()))
}

/// Body of a `Hello` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Announced to the server for its logs.
    pub client_name: String,
    /// Optional protocol features the client asks for.
    pub features: Vec<String>,
}

/// Body of a `Hello` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    /// Server build, reported in bootstrap results.
    pub server_version: String,
    /// Features the server agreed to.
    pub features: Vec<String>,
}

/// Body of an `Authenticate` request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Account name.
    pub username: String,
    /// Plain-text password; only sent over the established connection.
    pub password: String,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Body of every key-value request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRequest {
    /// Bucket the document lives in.
    pub bucket: String,
    /// Document id.
    pub key: String,
    /// JSON document for mutations.
    pub value: Option<Vec<u8>>,
    /// Compare-and-swap guard; 0 means unconditional.
    pub cas: u64,
    /// Document expiry in seconds; 0 means no expiry.
    pub expiry_secs: u32,
}

/// Body of a successful key-value response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvResponse {
    /// JSON document, for reads.
    pub value: Option<Vec<u8>>,
    /// Compare-and-swap value after the operation.
    pub cas: u64,
}

/// Body of any non-success response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Why the request failed.
    pub message: String,
}

/// Extracts a human-readable message from a failed response.
pub fn error_message(frame: &Frame) -> String {
    decode_body::<ErrorBody>(&frame.payload)
        .map(|b| b.message)
        .unwrap_or_else(|_| frame.status().to_string())
}
