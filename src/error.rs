//! Error types
//!
//! All fallible client operations return [`Result<T>`]. Errors raised inside
//! the reactor never escape it; they are logged and turned into a single
//! `Failed` connection state.

use std::time::Duration;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Attempted to send while the connection is not ready
    NotConnected,
    /// A correlated response did not arrive before the deadline
    Timeout(Duration),
    /// DNS or TCP level failure while connecting
    ConnectFailure(String),
    /// Server rejected the credentials or the handshake did not complete
    AuthFailure(String),
    /// Read, write or readiness error on an established socket
    Io(std::io::Error),
    /// The connection task was cancelled while connecting or waiting
    Interrupted,
    /// A frame could not be decoded
    Codec(CodecError),
    /// `start` called while the connection is not closed or failed
    AlreadyRunning,
    /// The server replied with something we cannot use
    Protocol(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotConnected => write!(f, "Not connected"),
            Error::Timeout(after) => write!(f, "No response after {:?}", after),
            Error::ConnectFailure(msg) => write!(f, "Connect failed: {}", msg),
            Error::AuthFailure(msg) => write!(f, "Authentication failed: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Interrupted => write!(f, "Interrupted"),
            Error::Codec(e) => write!(f, "Codec error: {}", e),
            Error::AlreadyRunning => write!(f, "Connection already running"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl Error {
    /// Whether the caller may simply retry once the connection is back
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotConnected | Error::Timeout(_))
    }
}

/// HTSMSG encoding and decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame length prefix exceeds the maximum we accept
    FrameTooLarge { size: usize, max: usize },
    /// A field header or payload runs past the end of its container
    Truncated,
    /// Unknown field type tag
    UnknownType(u8),
    /// String field or field name is not valid UTF-8
    InvalidUtf8,
    /// Integer field longer than eight bytes
    IntegerTooLong(usize),
    /// Field name longer than 255 bytes
    NameTooLong(usize),
    /// Containers nested deeper than we are willing to recurse
    NestingTooDeep,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {} bytes (max {})", size, max)
            }
            CodecError::Truncated => write!(f, "Truncated field"),
            CodecError::UnknownType(t) => write!(f, "Unknown field type: {}", t),
            CodecError::InvalidUtf8 => write!(f, "Invalid UTF-8"),
            CodecError::IntegerTooLong(len) => write!(f, "Integer field of {} bytes", len),
            CodecError::NameTooLong(len) => write!(f, "Field name of {} bytes", len),
            CodecError::NestingTooDeep => write!(f, "Nesting too deep"),
        }
    }
}

impl std::error::Error for CodecError {}
