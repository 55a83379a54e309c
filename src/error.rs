//! # Error Types
//!
//! Error handling for the RPC engine.
//!
//! Two kinds of failure live here. Local failures (a missing event name, a
//! timeout, a duplicate registration) surface as `ProtocolError` values in the
//! caller's `Result`. Remote failures (no handler, handler raised) travel over
//! the wire as error-tagged response packets carrying an [`ErrorCode`] and are
//! turned back into [`ProtocolError::Remote`] by the client.
//!
//! ## Error Categories
//! - **Request Errors**: missing event name, timeouts, remote rejections
//! - **Registration Errors**: duplicate event names, duplicate namespaces
//! - **Handshake Errors**: verification failures (fatal, never reported to the peer)
//! - **Codec / Crypto Errors**: serialization and envelope failures
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! ## Example Usage
//! ```rust
//! use uni_rpc::error::{ErrorCode, ProtocolError};
//!
//! let err = ProtocolError::Remote {
//!     code: ErrorCode::RespondNoEventHandler,
//!     message: "no handler registered for 'math::sub'".into(),
//! };
//! assert_eq!(err.code(), Some(ErrorCode::RespondNoEventHandler));
//! assert!(err.to_string().starts_with("Code: 3"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on method registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on method registry";

    /// Connection errors
    pub const ERR_TRANSPORT_GONE: &str = "Transport is no longer accepting frames";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_CIPHERTEXT_TOO_SHORT: &str = "Ciphertext shorter than nonce";

    /// Handshake-specific errors
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Malformed peer public key";
    pub const ERR_INVALID_SIGNATURE: &str = "Malformed signature";
    pub const ERR_CLIENT_SIGNATURE: &str = "Client signature verification failed";
    pub const ERR_SERVER_SIGNATURE: &str = "Server signature verification failed";
    pub const ERR_HASH_MISMATCH: &str = "Shared secret hash mismatch";
    pub const ERR_CLIENT_PUBLIC_NOT_FOUND: &str = "Client public key not found";
    pub const ERR_SERVER_KEY_NOT_FOUND: &str = "Server key pair not found";
    pub const ERR_INTERMEDIATE_NOT_FOUND: &str = "Intermediate secret not established";
    pub const ERR_SESSION_NOT_FOUND: &str = "Session secret not established";
    pub const ERR_CRYPTO_REQUIRED: &str = "Peer refused to negotiate encryption";
    pub const ERR_UNKNOWN_CLIENT: &str = "Request from unknown client";
    pub const ERR_MALFORMED_REPLY: &str = "Malformed handshake reply";
    pub const ERR_STEP_OUT_OF_ORDER: &str = "Handshake step out of order";
    pub const ERR_NOT_SECURED: &str = "Request before the secure handshake completed";
}

/// Numeric error codes carried in the `errorCode` meta field of error responses.
///
/// The numbering is part of the wire protocol and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    /// No matching response arrived before the deadline
    RequestTimeout = 1,
    /// `fire` was called without an event name
    RequestNoEvent = 2,
    /// The server has no handler for the requested event
    RespondNoEventHandler = 3,
    /// The handler raised an error or panicked
    UnknownError = 4,
    /// A namespace with that name already has methods registered
    NamespaceAlreadyRegistered = 5,
    /// An argument formatter or validator rejected the call
    InvalidArgument = 6,
}

impl ErrorCode {
    /// Wire representation of the code
    pub fn as_i64(self) -> i64 {
        self as u8 as i64
    }

    /// Parse a wire code, `None` for codes this version does not know
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::RequestTimeout),
            2 => Some(ErrorCode::RequestNoEvent),
            3 => Some(ErrorCode::RespondNoEventHandler),
            4 => Some(ErrorCode::UnknownError),
            5 => Some(ErrorCode::NamespaceAlreadyRegistered),
            6 => Some(ErrorCode::InvalidArgument),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Code: {}, Message: request fired without an event name", ErrorCode::RequestNoEvent)]
    RequestNoEvent,

    #[error(
        "Code: {}, Message: '{event}' got no response within {timeout:?}",
        ErrorCode::RequestTimeout
    )]
    RequestTimeout { event: String, timeout: Duration },

    #[error("Code: {code}, Message: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Code: {}, Message: the remote peer answered with unknown error code {code}: {message}", ErrorCode::UnknownError)]
    UnrecognizedRemote { code: i64, message: String },

    #[error("Event '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("Code: {}, Message: namespace '{0}' is already registered", ErrorCode::NamespaceAlreadyRegistered)]
    NamespaceAlreadyRegistered(String),

    #[error("Invalid argument '{argument}' for event '{event}': {reason}")]
    InvalidArgument {
        event: String,
        argument: String,
        reason: String,
    },

    #[error("Namespace '{namespace}' does not advertise method '{method}'")]
    UnknownMethod { namespace: String, method: String },

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// The wire error code this error corresponds to, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ProtocolError::RequestNoEvent => Some(ErrorCode::RequestNoEvent),
            ProtocolError::RequestTimeout { .. } => Some(ErrorCode::RequestTimeout),
            ProtocolError::Remote { code, .. } => Some(*code),
            ProtocolError::UnrecognizedRemote { .. } => Some(ErrorCode::UnknownError),
            ProtocolError::NamespaceAlreadyRegistered(_) => {
                Some(ErrorCode::NamespaceAlreadyRegistered)
            }
            ProtocolError::InvalidArgument { .. } => Some(ErrorCode::InvalidArgument),
            _ => None,
        }
    }

    /// Whether this error must tear the connection down instead of being answered.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::HandshakeError(_))
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error type returned by application handlers.
///
/// Anything convertible into a boxed error works with `?` inside a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values() {
        assert_eq!(ErrorCode::RequestTimeout.as_i64(), 1);
        assert_eq!(ErrorCode::RequestNoEvent.as_i64(), 2);
        assert_eq!(ErrorCode::RespondNoEventHandler.as_i64(), 3);
        assert_eq!(ErrorCode::UnknownError.as_i64(), 4);
        assert_eq!(ErrorCode::NamespaceAlreadyRegistered.as_i64(), 5);
        for code in 1..=6 {
            let parsed = ErrorCode::from_i64(code).map(ErrorCode::as_i64);
            assert_eq!(parsed, Some(code));
        }
        assert_eq!(ErrorCode::from_i64(42), None);
    }

    #[test]
    fn test_remote_message_is_composed_with_code() {
        let err = ProtocolError::Remote {
            code: ErrorCode::UnknownError,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Code: 4, Message: boom");
    }

    #[test]
    fn test_only_handshake_errors_are_fatal() {
        assert!(ProtocolError::HandshakeError("x".into()).is_fatal());
        assert!(!ProtocolError::ConnectionClosed.is_fatal());
        assert!(!ProtocolError::RequestNoEvent.is_fatal());
    }
}
