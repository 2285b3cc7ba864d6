//! Error types for gitwire

use crate::object::{ObjectId, ObjectType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Stream format errors. Always fatal to the current stream.
    #[error("invalid packfile header")]
    BadHeader,

    #[error("unsupported packfile version: {0}")]
    UnsupportedVersion(u32),

    #[error("packfile checksum mismatch")]
    Checksum,

    #[error("base128 number overflows 64 bits")]
    VarintOverflow,

    #[error("object size mismatch: header says {expected}, body has {actual}")]
    ObjectSize { expected: usize, actual: usize },

    #[error("unknown object type: {0}")]
    UnknownType(String),

    #[error("bad object type code: {0:#x}")]
    BadTypeCode(u8),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("invalid object format: {0}")]
    InvalidObject(String),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("pkt-line too long")]
    PktLineTooLong,

    #[error("invalid pkt-line length: {0:#06x}")]
    PktLineLength(usize),

    #[error("too many objects for one packfile")]
    TooManyObjects,

    // Delta base resolution. Fatal.
    #[error("unknown base for delta object")]
    BadBase,

    #[error("delta does not apply cleanly")]
    DeltaApply,

    // Reference errors. Reported per-command in receive-pack, fatal elsewhere.
    #[error("ref does not exist")]
    RefNotExist,

    #[error("ref already exists")]
    RefExists,

    #[error("ref value mismatch")]
    RefMismatch,

    #[error("invalid refname: {0}")]
    InvalidRef(String),

    // Object lookup.
    #[error("object does not exist: {0}")]
    ObjectNotExist(ObjectId),

    #[error("object type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: ObjectType,
    },

    // Capability negotiation.
    #[error("unrecognized capabilities: {0}")]
    UnknownCapability(String),

    // Protocol command parsing.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("repository lock poisoned")]
    LockPoisoned,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
