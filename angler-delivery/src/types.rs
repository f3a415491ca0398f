//! Message model shared by the engine and the cluster protocol

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};

use angler_common::config::RetentionConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::policy::EffectivePolicy;

/// Unique, sortable message identifier assigned at ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// How a message is handed to its recipient
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    #[default]
    Http,
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
        }
    }
}

const fn default_method() -> &'static str {
    "POST"
}

/// The request sent to the recipient. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Payload {
    /// A `POST` of `body` to `url` with no extra headers.
    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            method: default_method().to_string(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// An accepted message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub recipient_id: String,
    pub service_id: String,
    pub event_id: String,
    pub delivery_type: DeliveryType,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// Retry settings as a client wrote them, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedPolicy {
    /// A duration (`5m`) or a duration list (`[1m, 5m]`)
    pub interval: Option<String>,
    pub max_attempts: Option<i64>,
}

/// A message as produced by an ingestion transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub recipient_id: String,
    pub service_id: String,
    pub event_id: String,
    pub delivery_type: DeliveryType,
    pub payload: Payload,
    pub retry_policy: Option<RequestedPolicy>,
}

impl Submission {
    #[must_use]
    pub fn new(
        recipient_id: impl Into<String>,
        service_id: impl Into<String>,
        event_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            service_id: service_id.into(),
            event_id: event_id.into(),
            delivery_type: DeliveryType::Http,
            payload,
            retry_policy: None,
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, interval: Option<&str>, max_attempts: Option<i64>) -> Self {
        self.retry_policy = Some(RequestedPolicy {
            interval: interval.map(ToString::to_string),
            max_attempts,
        });
        self
    }

    /// Stamp the submission with an identifier and creation time.
    #[must_use]
    pub fn into_message(self, id: MessageId, created_at: DateTime<Utc>) -> Message {
        Message {
            id,
            recipient_id: self.recipient_id,
            service_id: self.service_id,
            event_id: self.event_id,
            delivery_type: self.delivery_type,
            payload: self.payload,
            created_at,
        }
    }
}

/// Lifecycle state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Awaiting its first attempt, or returned for redispatch
    Pending,
    /// Checked out to a worker
    Attempting,
    /// Waiting for its next due time
    PendingRetry,
    /// Checked out to a broker (controller only)
    Dispatched,
    Delivered,
    Dead,
}

impl MessageState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Dead)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Attempting => "ATTEMPTING",
            Self::PendingRetry => "PENDING_RETRY",
            Self::Dispatched => "DISPATCHED",
            Self::Delivered => "DELIVERED",
            Self::Dead => "DEAD",
        })
    }
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    Failure(String),
    Timeout,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The failure reason, if the attempt did not succeed
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Success => None,
            Self::Failure(reason) => Some(reason.clone()),
            Self::Timeout => Some("delivery attempt timed out".to_string()),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failure(reason) => write!(f, "FAILURE({reason})"),
            Self::Timeout => f.write_str("TIMEOUT"),
        }
    }
}

/// Record of one try, used for transitions and audit logging only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
}

/// Final classification of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalOutcome {
    Delivered,
    Dead,
}

impl From<TerminalOutcome> for MessageState {
    fn from(outcome: TerminalOutcome) -> Self {
        match outcome {
            TerminalOutcome::Delivered => Self::Delivered,
            TerminalOutcome::Dead => Self::Dead,
        }
    }
}

/// What the retention purge sees of a finished message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub message_id: MessageId,
    pub outcome: TerminalOutcome,
    pub attempts: u32,
    pub terminal_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl TerminalRecord {
    /// Whether the retention window for this outcome has elapsed at `now`.
    ///
    /// Outcomes without a configured window are kept indefinitely.
    #[must_use]
    pub fn is_expired(&self, retention: &RetentionConfiguration, now: DateTime<Utc>) -> bool {
        let window = match self.outcome {
            TerminalOutcome::Delivered => retention.delivered_messages,
            TerminalOutcome::Dead => retention.dead_messages,
        };

        window
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .and_then(|window| self.terminal_at.checked_add_signed(window))
            .is_some_and(|expires_at| expires_at <= now)
    }
}

/// A point-in-time copy of everything the engine knows about a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message: Arc<Message>,
    pub policy: EffectivePolicy,
    pub state: MessageState,
    pub attempts: u32,
    /// Set only while `PendingRetry`
    pub next_due: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_outcome: Option<AttemptOutcome>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// Broker holding the message while `Dispatched`
    pub owner: Option<String>,
}

impl MessageRecord {
    #[must_use]
    pub fn terminal(&self) -> Option<TerminalRecord> {
        let outcome = match self.state {
            MessageState::Delivered => TerminalOutcome::Delivered,
            MessageState::Dead => TerminalOutcome::Dead,
            _ => return None,
        };

        Some(TerminalRecord {
            message_id: self.message.id,
            outcome,
            attempts: self.attempts,
            terminal_at: self.terminal_at?,
            last_error: self.last_error.clone(),
        })
    }
}

/// A message checked out by the controller for delivery on a broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedMessage {
    pub message: Message,
    pub policy: EffectivePolicy,
    /// Attempts already made elsewhere
    pub attempts: u32,
}

/// Number of messages in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub attempting: usize,
    pub pending_retry: usize,
    pub dispatched: usize,
    pub delivered: usize,
    pub dead: usize,
}

impl StateCounts {
    pub(crate) fn record(&mut self, state: MessageState) {
        match state {
            MessageState::Pending => self.pending += 1,
            MessageState::Attempting => self.attempting += 1,
            MessageState::PendingRetry => self.pending_retry += 1,
            MessageState::Dispatched => self.dispatched += 1,
            MessageState::Delivered => self.delivered += 1,
            MessageState::Dead => self.dead += 1,
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending
            + self.attempting
            + self.pending_retry
            + self.dispatched
            + self.delivered
            + self.dead
    }
}
