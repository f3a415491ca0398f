//! Cluster protocol types

use std::fmt;

use angler_delivery::{DispatchedMessage, MessageId};
use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 2;

/// Request sent from a broker to the controller (versioned wrapper)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub version: u32,
    /// Broker the request is sent on behalf of
    pub broker_id: String,
    /// Session issued by a successful authentication
    pub session: Option<String>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Join the cluster with the shared key
    Authenticate { id: String, auth_token: String },
    /// Heartbeat
    HealthCheck,
    /// A dispatched message was delivered
    ConfirmMessageSent { message_id: MessageId, attempts: u32 },
    /// A dispatched message exhausted its attempts
    ConfirmMessageDead {
        message_id: MessageId,
        attempts: u32,
        last_error: Option<String>,
    },
    /// Check out up to `max` due messages.
    ///
    /// A broker numbers its pulls and repeats the number until it receives
    /// the answer. A repeated `batch` returns the messages of that batch
    /// still dispatched to the broker instead of checking out new ones.
    PullMessages { max: u32, batch: u64 },
    /// Attempts made so far on dispatched messages that are not terminal yet
    ReportAttempts { attempts: Vec<(MessageId, u32)> },
    /// Leave the cluster, returning anything still dispatched
    Deauthenticate,
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "Authenticate",
            Self::HealthCheck => "HealthCheck",
            Self::ConfirmMessageSent { .. } => "ConfirmMessageSent",
            Self::ConfirmMessageDead { .. } => "ConfirmMessageDead",
            Self::PullMessages { .. } => "PullMessages",
            Self::ReportAttempts { .. } => "ReportAttempts",
            Self::Deauthenticate => "Deauthenticate",
        }
    }
}

impl Request {
    #[must_use]
    pub fn new(broker_id: impl Into<String>, session: Option<String>, command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            broker_id: broker_id.into(),
            session,
            command,
        }
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Machine readable outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResponseCode {
    Ok = 0,
    /// The request had already been applied; nothing changed
    AlreadyApplied = 1,
    InvalidAuthKey = 10,
    /// Another live broker holds this ID
    DuplicateBrokerId = 11,
    /// No valid session; the broker must authenticate again
    NotAuthenticated = 12,
    /// The controller has no `cluster.authKey`
    ClusterAuthDisabled = 13,
    UnknownMessage = 20,
    InvalidTransition = 21,
    /// The message already carries the other terminal outcome
    AlreadyTerminal = 22,
    IncompatibleVersion = 90,
    MalformedRequest = 91,
    Internal = 99,
}

impl ResponseCode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::AlreadyApplied,
            10 => Self::InvalidAuthKey,
            11 => Self::DuplicateBrokerId,
            12 => Self::NotAuthenticated,
            13 => Self::ClusterAuthDisabled,
            20 => Self::UnknownMessage,
            21 => Self::InvalidTransition,
            22 => Self::AlreadyTerminal,
            90 => Self::IncompatibleVersion,
            91 => Self::MalformedRequest,
            99 => Self::Internal,
            _ => return None,
        })
    }

    /// Codes that report success
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::AlreadyApplied)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.as_u16())
    }
}

/// Response from the controller (versioned wrapper)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub success: bool,
    /// A [`ResponseCode`]
    pub code: u16,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Empty,
    /// Issued on successful authentication
    Session {
        session: String,
        /// How often the controller expects a health check
        heartbeat_interval_ms: u64,
    },
    Messages(Vec<DispatchedMessage>),
    Error(String),
}

impl Response {
    #[must_use]
    pub const fn new(code: ResponseCode, payload: ResponsePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            success: code.is_success(),
            code: code.as_u16(),
            payload,
        }
    }

    #[must_use]
    pub const fn ok() -> Self {
        Self::new(ResponseCode::Ok, ResponsePayload::Empty)
    }

    #[must_use]
    pub fn error(code: ResponseCode, message: impl Into<String>) -> Self {
        Self::new(code, ResponsePayload::Error(message.into()))
    }

    /// The response code, if it is one this build knows
    #[must_use]
    pub const fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_u16(self.code)
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_response_codes_round_trip() {
        for code in [
            ResponseCode::Ok,
            ResponseCode::AlreadyApplied,
            ResponseCode::InvalidAuthKey,
            ResponseCode::DuplicateBrokerId,
            ResponseCode::NotAuthenticated,
            ResponseCode::ClusterAuthDisabled,
            ResponseCode::UnknownMessage,
            ResponseCode::InvalidTransition,
            ResponseCode::AlreadyTerminal,
            ResponseCode::IncompatibleVersion,
            ResponseCode::MalformedRequest,
            ResponseCode::Internal,
        ] {
            assert_eq!(ResponseCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ResponseCode::from_u16(42), None);
    }

    #[test]
    fn test_success_follows_code() {
        assert!(Response::ok().success);
        assert!(Response::new(ResponseCode::AlreadyApplied, ResponsePayload::Empty).success);

        let response = Response::error(ResponseCode::InvalidAuthKey, "bad key");
        assert!(!response.success);
        assert_eq!(response.code, 10);
        assert_eq!(response.response_code(), Some(ResponseCode::InvalidAuthKey));
    }

    #[test]
    fn test_request_version() {
        let mut request = Request::new("broker-1", None, Command::HealthCheck);
        assert!(request.is_version_compatible());

        request.version = PROTOCOL_VERSION + 1;
        assert!(!request.is_version_compatible());
    }
}
