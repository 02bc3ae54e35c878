use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::Status;

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Callset {name} version {version} is already registered")]
    DuplicateCallset { name: String, version: u32 },

    #[error("Unknown callset: {0}")]
    UnknownCallset(String),

    #[error("Unknown operation {operation} in callset {callset}")]
    UnknownOperation { callset: String, operation: String },

    #[error("Unknown argument {argument} for operation {operation}")]
    UnknownArgument { operation: String, argument: String },

    #[error("Invalid argument {field}: {reason}")]
    ArgumentType { field: String, reason: String },

    #[error("Invalid callset definition: {0}")]
    Schema(String),

    #[error("Failed to connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    pub fn argument_type(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RpcError::ArgumentType {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        RpcError::Decode(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        RpcError::Schema(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RpcError::Config(msg.into())
    }

    /// Transport-level failures that a caller may retry on a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Connection { .. }
                | RpcError::ConnectionClosed
                | RpcError::Timeout(_)
                | RpcError::Io(_)
        )
    }
}

/// Application-level failure reported by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub status: Status,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        RemoteError {
            status,
            message: message.into(),
        }
    }

    /// Error raised by an operation handler.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(Status::HandlerError, message)
    }

    pub fn from_payload(status: Status, payload: &[u8]) -> Self {
        Self::new(status, String::from_utf8_lossy(payload))
    }

    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(self.message.as_bytes())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}
