//! # Error Types
//!
//! Error handling for the wire format, connections and the session layer.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! is [`ProtocolError`]. Variants are grouped into a small taxonomy via
//! [`ProtocolError::kind`] so callers can react to a class of failure without
//! matching every variant.
//!
//! ## Error Categories
//! - **Encoding**: malformed headers, size mismatches, corrupt compression,
//!   buffer bounds violations
//! - **Authentication**: invalid or missing tickets, duplicate sessions
//! - **Capacity**: host is full
//! - **Transport**: send/allocation failures in the underlying transport
//! - **Timeout / Cancelled**: connect attempts that never reached Active
//!
//! ## Example Usage
//! ```rust
//! use session_wire::core::byte_buffer::ByteBuffer;
//! use session_wire::error::{ErrorKind, Result};
//!
//! fn read_score(raw: &[u8]) -> Result<u32> {
//!     let mut reader = ByteBuffer::reader(raw.to_vec());
//!     reader.read::<u32>()
//! }
//!
//! let err = read_score(&[1, 2]).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Encoding);
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Reason strings surfaced to remote peers and in logs.
/// Static strings are borrowed, avoiding heap allocations for common close paths.
pub mod constants {
    /// Capacity refusal at Welcome
    pub const REASON_SERVER_FULL: &str = "Server Full";

    /// Authentication failures
    pub const REASON_AUTH_FAILED: &str = "Authentication failed";
    pub const REASON_MISSING_TICKET: &str = "Missing authentication ticket";
    pub const REASON_INVALID_TICKET: &str = "Invalid authentication ticket";
    pub const REASON_DUPLICATE_SESSION: &str = "Duplicate session";

    /// Session lifecycle
    pub const REASON_HOST_SHUTDOWN: &str = "Host shutting down";
    pub const REASON_DISCONNECTED: &str = "Disconnected";
    pub const REASON_KICKED: &str = "Kicked by host";
    pub const REASON_PROTOCOL_VIOLATION: &str = "Protocol violation";
    pub const REASON_CONNECT_TIMEOUT: &str = "Connect attempt timed out";

    /// Transport-level
    pub const REASON_TIMED_OUT: &str = "Timed out";
    pub const REASON_NO_LISTENER: &str = "No listener at address";
    pub const REASON_ROUTE_NOT_FOUND: &str = "No route to peer";

    /// Error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_NOT_CONNECTED: &str = "Transport handle is not connected";
    pub const ERR_UNKNOWN_HANDLE: &str = "Unknown transport handle";
    pub const ERR_UNKNOWN_POLL_GROUP: &str = "Unknown poll group";
}

/// Coarse classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Encoding,
    Authentication,
    Capacity,
    Transport,
    Timeout,
    Cancelled,
    Config,
    Other,
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Read of {requested} bytes exceeds the {available} bytes remaining")]
    BufferOverrun { requested: usize, available: usize },

    #[error("Invalid length prefix: {0}")]
    InvalidLength(i64),

    #[error("Buffer would grow beyond the maximum size: {0} bytes")]
    BufferTooLarge(usize),

    #[error("Buffer has been disposed")]
    BufferDisposed,

    #[error("Buffer is read-only")]
    ReadOnlyBuffer,

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame size mismatch: header says {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Unknown session message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Server is full")]
    ServerFull,

    #[error("Operation requires the host role")]
    NotHost,

    #[error("No route to peer {0}")]
    NoRoute(String),

    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::BufferOverrun { .. }
            | ProtocolError::InvalidLength(_)
            | ProtocolError::BufferTooLarge(_)
            | ProtocolError::InvalidUtf8
            | ProtocolError::InvalidHeader
            | ProtocolError::SizeMismatch { .. }
            | ProtocolError::OversizedPacket(_)
            | ProtocolError::DecompressionFailure
            | ProtocolError::UnknownMessageKind(_)
            | ProtocolError::UnexpectedMessage(_) => ErrorKind::Encoding,
            ProtocolError::AuthenticationError(_) => ErrorKind::Authentication,
            ProtocolError::ServerFull => ErrorKind::Capacity,
            ProtocolError::Io(_)
            | ProtocolError::TransportError(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::NoRoute(_) => ErrorKind::Transport,
            ProtocolError::Timeout => ErrorKind::Timeout,
            ProtocolError::Cancelled => ErrorKind::Cancelled,
            ProtocolError::ConfigError(_) => ErrorKind::Config,
            ProtocolError::BufferDisposed
            | ProtocolError::ReadOnlyBuffer
            | ProtocolError::NotHost
            | ProtocolError::InvalidStateTransition { .. }
            | ProtocolError::Custom(_) => ErrorKind::Other,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
