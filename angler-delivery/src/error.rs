//! Typed error handling for the delivery engine.
//!
//! Three families are kept apart:
//! - [`PolicyError`]: a retry policy is structurally invalid, raised at ingestion
//! - [`DeliveryError`]: a single attempt did not succeed, which drives a retry decision
//! - [`EngineError`]: a caller asked the engine for something it cannot do

use std::time::Duration;

use angler_common::time::DurationParseError;
use thiserror::Error;

use crate::types::{MessageId, MessageState};

/// A requested or configured retry policy is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// `maxAttempts` was below zero.
    #[error("Max attempts must not be negative, got {0}")]
    NegativeMaxAttempts(i64),

    /// `maxAttempts` does not fit the supported range.
    #[error("Max attempts out of range: {0}")]
    MaxAttemptsOutOfRange(i64),

    /// An empty interval list asks for retries but no default interval exists.
    #[error("Empty retry interval with {max_attempts} max attempts and no default interval")]
    EmptyInterval { max_attempts: u32 },

    /// The interval did not follow Angler time syntax.
    #[error("Invalid retry interval: {0}")]
    InvalidInterval(#[from] DurationParseError),

    /// The configured interval bounds are inverted.
    #[error("Minimum interval {min:?} exceeds maximum interval {max:?}")]
    InvertedLimits { min: Duration, max: Duration },

    /// The configured attempt limit is zero.
    #[error("Attempt limit must be at least 1")]
    ZeroAttemptLimit,
}

/// Why a delivery attempt did not succeed.
///
/// Every variant is recoverable from the engine's point of view: it is fed
/// into the retry decision rather than surfaced to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The recipient rejected the message or could not be reached.
    #[error("Delivery failed: {0}")]
    Failure(String),

    /// The attempt exceeded its time budget.
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The worker running the attempt faulted.
    #[error("Worker fault: {0}")]
    Fault(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }

        if error.is_connect() {
            return Self::Failure(format!("connection failed: {error}"));
        }

        if error.is_builder() {
            return Self::Failure(format!("invalid request: {error}"));
        }

        Self::Failure(error.to_string())
    }
}

impl From<tokio::task::JoinError> for DeliveryError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_panic() {
            let panic = error.into_panic();
            let reason = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            return Self::Fault(reason);
        }

        Self::Fault(error.to_string())
    }
}

/// Raw client input could not be turned into a submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No transport is registered under this name.
    #[error("Unsupported client protocol: {0}")]
    UnknownProtocol(String),

    /// The transport could not decode the request.
    #[error("Malformed {protocol} request: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },
}

/// Misuse of the engine: the requested operation does not apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// The message is not in a state that accepts this event.
    #[error("Message {id} cannot {event} while {state}")]
    InvalidTransition {
        id: MessageId,
        state: MessageState,
        event: &'static str,
    },

    /// The message already reached a terminal state.
    #[error("Message {id} is already {state}")]
    AlreadyTerminal { id: MessageId, state: MessageState },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
