//! Error types for cluster operations

use thiserror::Error;

use crate::protocol::ResponseCode;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// I/O error talking to a peer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolDeserialization(#[from] bincode::error::DecodeError),

    #[error("Protocol error: {0}")]
    ProtocolSerialization(#[from] bincode::error::EncodeError),

    /// A frame exceeded the size limit for its direction
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Incompatible protocol version: remote={remote}, local={local}")]
    IncompatibleVersion { remote: u32, local: u32 },

    /// The controller answered with `success = false`
    #[error("Request rejected with {code}: {message}")]
    Rejected { code: u16, message: String },

    /// The controller answered with a payload the command does not produce
    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    /// Cluster mode was requested without `cluster.authKey`
    #[error("Cluster mode requires cluster.authKey")]
    AuthKeyMissing,

    #[error(transparent)]
    Policy(#[from] angler_delivery::PolicyError),
}

impl ClusterError {
    /// The response code carried by a rejection
    #[must_use]
    pub const fn code(&self) -> Option<ResponseCode> {
        match self {
            Self::Rejected { code, .. } => ResponseCode::from_u16(*code),
            _ => None,
        }
    }

    /// Whether the broker has to authenticate again before continuing
    #[must_use]
    pub const fn is_session_lost(&self) -> bool {
        matches!(self.code(), Some(ResponseCode::NotAuthenticated))
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;
