//! # Error Taxonomy
//!
//! Purpose: give every failure mode in the client a distinct, matchable
//! variant instead of collapsing transport, protocol, and value-layer
//! failures into a single opaque error.
//!
//! ## Design Principles
//! 1. **Symbolic, Not Type-Tied**: one variant per distinct failure reason,
//!    mirroring the server's own status codes where one exists.
//! 2. **Sentinel Distinction**: `BadConnection` and `NotConnected` are never
//!    surfaced as ordinary server errors — the pool and controller inspect
//!    them directly to decide whether to retry or destroy a connection.
//! 3. **No Retry Hidden Here**: this module only classifies errors; retry
//!    policy lives in the controller.

use std::fmt;
use std::io;

/// Result type threaded through the whole client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the memcache client.
#[derive(Debug)]
pub enum ClientError {
    /// I/O failed mid-exchange (short read/write, deadline expiry). The
    /// connection that produced this must be destroyed, not reused.
    BadConnection,
    /// A connection could not be established to a server's address.
    NotConnected,
    /// The response header's magic byte was not `0x81`, or a `get`
    /// response's `extlen` was not 4.
    Framing,

    /// Key not found (status `0x01`).
    NotFound,
    /// Key already exists for an `Add` (status `0x02`).
    KeyExists,
    /// Value too large for the server to store (status `0x03`).
    TooBig,
    /// Invalid arguments in the request (status `0x04`).
    Invalid,
    /// Item not stored, e.g. a failed `Replace`/`Append` (status `0x05`).
    NotStored,
    /// Increment/decrement attempted on a non-numeric value (status `0x06`).
    DeltaBadVal,
    /// Authentication error (status `0x20`). No handshake is driven by this
    /// client; this variant exists so the status code is representable.
    AuthError,
    /// Authentication continuation required (status `0x21`).
    AuthContinue,
    /// Server did not recognize the opcode (status `0x81`).
    UnknownCommand,
    /// Server is out of memory (status `0x82`).
    OutOfMemory,
    /// Any other status code.
    Unknown(u16),

    /// The value being stored is of an unsupported kind.
    InvalidValueType,
    /// A structured value failed to decode.
    InvalidFormat,
    /// A structured value was read without a destination to decode into.
    NoFormat,

    /// No server owns any ring position (the ring is empty).
    NoServer,
    /// The connection pool has no way to satisfy the request (only
    /// returned by non-blocking pool operations; `acquire` retries/blocks
    /// instead of returning this to callers directly).
    PoolExhausted,
    /// A configured address could not be parsed as a socket address.
    InvalidAddress,
}

impl ClientError {
    /// Maps a protocol status code (§6) to its typed error.
    pub fn from_status(status: u16) -> Option<ClientError> {
        match status {
            0x00 => None,
            0x01 => Some(ClientError::NotFound),
            0x02 => Some(ClientError::KeyExists),
            0x03 => Some(ClientError::TooBig),
            0x04 => Some(ClientError::Invalid),
            0x05 => Some(ClientError::NotStored),
            0x06 => Some(ClientError::DeltaBadVal),
            0x20 => Some(ClientError::AuthError),
            0x21 => Some(ClientError::AuthContinue),
            0x81 => Some(ClientError::UnknownCommand),
            0x82 => Some(ClientError::OutOfMemory),
            other => Some(ClientError::Unknown(other)),
        }
    }

    /// True for the transport sentinel that tells the pool to destroy the
    /// connection rather than return it.
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, ClientError::BadConnection)
    }

    /// True for the transport sentinel that tells the controller to notify
    /// the health thread.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ClientError::NotConnected)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::BadConnection => write!(f, "connection closed mid-exchange"),
            ClientError::NotConnected => write!(f, "can't connect to server"),
            ClientError::Framing => write!(f, "malformed response frame"),
            ClientError::NotFound => write!(f, "key not found"),
            ClientError::KeyExists => write!(f, "key exists"),
            ClientError::TooBig => write!(f, "value too large"),
            ClientError::Invalid => write!(f, "invalid arguments"),
            ClientError::NotStored => write!(f, "item not stored"),
            ClientError::DeltaBadVal => write!(f, "increment/decrement on non-numeric value"),
            ClientError::AuthError => write!(f, "authentication error"),
            ClientError::AuthContinue => write!(f, "authentication continue"),
            ClientError::UnknownCommand => write!(f, "unknown command"),
            ClientError::OutOfMemory => write!(f, "server out of memory"),
            ClientError::Unknown(status) => write!(f, "unknown server status {:#06x}", status),
            ClientError::InvalidValueType => write!(f, "unsupported value type"),
            ClientError::InvalidFormat => write!(f, "invalid structured value format"),
            ClientError::NoFormat => write!(f, "structured value requires a destination"),
            ClientError::NoServer => write!(f, "no server owns this key"),
            ClientError::PoolExhausted => write!(f, "connection pool exhausted"),
            ClientError::InvalidAddress => write!(f, "invalid server address"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(_: io::Error) -> Self {
        // Any I/O failure mid-exchange is indistinguishable from the
        // connection's point of view: it must be discarded.
        ClientError::BadConnection
    }
}
