//! Message lifecycle.
//!
//! Every state change goes through [`MessageStateMachine`], and every change
//! happens under the message's map entry lock, so state, attempt count and
//! due time are always updated together. Unrelated messages never contend.
//!
//! ```text
//! PENDING ──dispatch to worker──▶ ATTEMPTING ──SUCCESS──▶ DELIVERED
//!    ▲  │                            │  ▲
//!    │  │                   FAILURE/ │  │ due
//!    │  │                   TIMEOUT  ▼  │
//!    │  │                         PENDING_RETRY
//!    │  └──pull by broker──▶ DISPATCHED ──confirm──▶ DELIVERED | DEAD
//!    └────broker lost──────────┘
//! ```
//!
//! Transitions take the current time as an argument so the machine stays
//! free of clocks and can be driven deterministically.

use std::sync::Arc;

use angler_common::{config::RetentionConfiguration, internal};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    policy::EffectivePolicy,
    types::{
        AttemptOutcome, DispatchedMessage, Message, MessageId, MessageRecord, MessageState,
        StateCounts, TerminalOutcome, TerminalRecord,
    },
};

/// Ownership of a message for the duration of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptTicket {
    pub message: Arc<Message>,
    /// One based attempt number
    pub attempt: u32,
}

/// What an attempt outcome did to its message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Delivered(TerminalRecord),
    Retry { due: DateTime<Utc>, attempts: u32 },
    Dead(TerminalRecord),
}

impl Transition {
    #[must_use]
    pub const fn terminal(&self) -> Option<&TerminalRecord> {
        match self {
            Self::Delivered(record) | Self::Dead(record) => Some(record),
            Self::Retry { .. } => None,
        }
    }
}

/// Result of merging a terminal outcome reported from elsewhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The outcome was recorded by this call.
    Applied(TerminalRecord),
    /// The message already carried this outcome; nothing changed.
    AlreadyApplied(TerminalRecord),
}

impl Confirmation {
    #[must_use]
    pub const fn record(&self) -> &TerminalRecord {
        match self {
            Self::Applied(record) | Self::AlreadyApplied(record) => record,
        }
    }
}

/// The authoritative record of every message known to this node
#[derive(Debug, Default)]
pub struct MessageStateMachine {
    records: DashMap<MessageId, MessageRecord>,
}

fn invalid(id: MessageId, state: MessageState, event: &'static str) -> EngineError {
    if state.is_terminal() {
        EngineError::AlreadyTerminal { id, state }
    } else {
        EngineError::InvalidTransition { id, state, event }
    }
}

fn is_due(record: &MessageRecord, now: DateTime<Utc>) -> bool {
    match record.state {
        MessageState::Pending => true,
        MessageState::PendingRetry => record.next_due.is_none_or(|due| due <= now),
        _ => false,
    }
}

impl MessageStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new message in `PENDING`.
    pub fn enqueue(&self, message: Message, policy: EffectivePolicy) -> MessageId {
        let id = message.id;
        self.insert(message, policy, 0);
        id
    }

    /// Take over a message the controller checked out to this node.
    ///
    /// The attempt count carried over is capped so that at least one attempt
    /// remains. Returns `None`, leaving the local record alone, if the message
    /// is already known here.
    pub fn accept_dispatched(&self, dispatched: DispatchedMessage) -> Option<MessageId> {
        let attempts = dispatched
            .attempts
            .min(dispatched.policy.max_attempts().saturating_sub(1));
        let id = dispatched.message.id;
        self.insert(dispatched.message, dispatched.policy, attempts)
            .then_some(id)
    }

    fn insert(&self, message: Message, policy: EffectivePolicy, attempts: u32) -> bool {
        let id = message.id;
        let Entry::Vacant(entry) = self.records.entry(id) else {
            debug!(message_id = %id, "Message already known, not replacing it");
            return false;
        };

        internal!(
            level = DEBUG,
            message_id = %id,
            policy = %policy,
            attempts,
            "Message enqueued"
        );

        entry.insert(MessageRecord {
            message: Arc::new(message),
            policy,
            state: MessageState::Pending,
            attempts,
            next_due: None,
            last_error: None,
            last_outcome: None,
            terminal_at: None,
            owner: None,
        });

        true
    }

    /// `PENDING | due PENDING_RETRY → ATTEMPTING`.
    ///
    /// The attempt count is incremented here, before the outcome is known.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown, already owned, not yet due, terminal,
    /// or has no attempts left.
    pub fn begin_attempt(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<AttemptTicket, EngineError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMessage(id))?;
        let record = entry.value_mut();

        if !is_due(record, now) {
            return Err(invalid(id, record.state, "begin an attempt"));
        }

        if record.attempts >= record.policy.max_attempts() {
            return Err(invalid(id, record.state, "exceed its attempt limit"));
        }

        record.state = MessageState::Attempting;
        record.attempts += 1;
        record.next_due = None;

        Ok(AttemptTicket {
            message: Arc::clone(&record.message),
            attempt: record.attempts,
        })
    }

    /// `ATTEMPTING → DELIVERED | PENDING_RETRY | DEAD`.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown or not currently being attempted.
    pub fn complete_attempt(
        &self,
        id: MessageId,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<Transition, EngineError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMessage(id))?;
        let record = entry.value_mut();

        if record.state != MessageState::Attempting {
            return Err(invalid(id, record.state, "complete an attempt"));
        }

        let error = outcome.error();
        record.last_outcome = Some(outcome);

        let Some(error) = error else {
            record.state = MessageState::Delivered;
            record.terminal_at = Some(now);
            info!(message_id = %id, attempts = record.attempts, "Message delivered");
            return Ok(Transition::Delivered(terminal(record, now, TerminalOutcome::Delivered)));
        };

        record.last_error = Some(error);

        let delay = record
            .policy
            .has_attempts_remaining(record.attempts)
            .then(|| record.policy.next_delay(record.attempts.saturating_sub(1)))
            .flatten();

        if let Some(delay) = delay {
            let due = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            record.state = MessageState::PendingRetry;
            record.next_due = Some(due);
            debug!(
                message_id = %id,
                attempts = record.attempts,
                max_attempts = record.policy.max_attempts(),
                %due,
                "Retry scheduled"
            );
            return Ok(Transition::Retry {
                due,
                attempts: record.attempts,
            });
        }

        record.state = MessageState::Dead;
        record.terminal_at = Some(now);
        warn!(
            message_id = %id,
            attempts = record.attempts,
            last_error = record.last_error.as_deref().unwrap_or_default(),
            "Message is dead"
        );
        Ok(Transition::Dead(terminal(record, now, TerminalOutcome::Dead)))
    }

    /// `PENDING | due PENDING_RETRY → DISPATCHED`, checking the message out to
    /// `broker_id`.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown, owned elsewhere, not yet due or terminal.
    pub fn dispatch(
        &self,
        id: MessageId,
        broker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchedMessage, EngineError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMessage(id))?;
        let record = entry.value_mut();

        if !is_due(record, now) {
            return Err(invalid(id, record.state, "be dispatched"));
        }

        record.state = MessageState::Dispatched;
        record.next_due = None;
        record.owner = Some(broker_id.to_string());

        Ok(DispatchedMessage {
            message: (*record.message).clone(),
            policy: record.policy.clone(),
            attempts: record.attempts,
        })
    }

    /// `DISPATCHED → PENDING`.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown or not dispatched.
    pub fn release(&self, id: MessageId) -> Result<(), EngineError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMessage(id))?;
        let record = entry.value_mut();

        if record.state != MessageState::Dispatched {
            return Err(invalid(id, record.state, "be released"));
        }

        record.state = MessageState::Pending;
        record.owner = None;
        Ok(())
    }

    /// Return every message dispatched to `broker_id` to `PENDING`.
    pub fn release_broker(&self, broker_id: &str) -> Vec<MessageId> {
        let mut released = Vec::new();

        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.state == MessageState::Dispatched
                && record.owner.as_deref() == Some(broker_id)
            {
                record.state = MessageState::Pending;
                record.owner = None;
                released.push(record.message.id);
            }
        }

        released.sort_unstable();
        released
    }

    /// The message as dispatched, if it is still checked out to `broker_id`.
    #[must_use]
    pub fn dispatched_to(&self, id: MessageId, broker_id: &str) -> Option<DispatchedMessage> {
        self.records
            .get(&id)
            .filter(|record| {
                record.state == MessageState::Dispatched
                    && record.owner.as_deref() == Some(broker_id)
            })
            .map(|record| DispatchedMessage {
                message: (*record.message).clone(),
                policy: record.policy.clone(),
                attempts: record.attempts,
            })
    }

    /// Merge the attempt count reported by the broker holding a dispatched
    /// message, so a later dispatch only gets the attempts that remain.
    ///
    /// The count never decreases and is capped at the policy maximum.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown or not dispatched to `broker_id`.
    pub fn record_attempts(
        &self,
        id: MessageId,
        broker_id: &str,
        attempts: u32,
    ) -> Result<u32, EngineError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMessage(id))?;
        let record = entry.value_mut();

        if record.state != MessageState::Dispatched || record.owner.as_deref() != Some(broker_id) {
            return Err(invalid(id, record.state, "record attempts"));
        }

        record.attempts = record
            .attempts
            .max(attempts)
            .min(record.policy.max_attempts());
        Ok(record.attempts)
    }

    /// Merge a terminal outcome reported by a broker.
    ///
    /// The first terminal outcome wins. A late report for a message that has
    /// since been released or picked up again is still applied. The reported
    /// attempt count is capped at the policy maximum.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown or already carries the other terminal
    /// outcome.
    pub fn confirm(
        &self,
        id: MessageId,
        outcome: TerminalOutcome,
        attempts: u32,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Confirmation, EngineError> {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMessage(id))?;
        let record = entry.value_mut();

        if record.state.is_terminal() {
            let at = record.terminal_at.unwrap_or(now);
            return if record.state == MessageState::from(outcome) {
                Ok(Confirmation::AlreadyApplied(terminal(record, at, outcome)))
            } else {
                Err(EngineError::AlreadyTerminal {
                    id,
                    state: record.state,
                })
            };
        }

        if record.state != MessageState::Dispatched {
            warn!(
                message_id = %id,
                state = %record.state,
                "Applying late confirmation"
            );
        }

        record.state = outcome.into();
        record.attempts = record
            .attempts
            .max(attempts)
            .min(record.policy.max_attempts());
        record.terminal_at = Some(now);
        record.next_due = None;
        record.owner = None;
        if outcome == TerminalOutcome::Dead {
            record.last_error = last_error;
        }

        internal!(
            level = INFO,
            message_id = %id,
            outcome = ?outcome,
            attempts = record.attempts,
            "Confirmation applied"
        );
        Ok(Confirmation::Applied(terminal(record, now, outcome)))
    }

    /// Drop every message that is waiting for an attempt on this node.
    pub fn abandon_unstarted(&self) -> Vec<MessageId> {
        let mut abandoned = Vec::new();
        self.records.retain(|id, record| {
            let waiting = matches!(
                record.state,
                MessageState::Pending | MessageState::PendingRetry
            );
            if waiting {
                abandoned.push(*id);
            }
            !waiting
        });
        abandoned
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<MessageRecord> {
        self.records.get(&id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn state(&self, id: MessageId) -> Option<MessageState> {
        self.records.get(&id).map(|entry| entry.value().state)
    }

    #[must_use]
    pub fn terminal_records(&self) -> Vec<TerminalRecord> {
        self.records
            .iter()
            .filter_map(|entry| entry.value().terminal())
            .collect()
    }

    /// Terminal messages whose retention window elapsed by `now`.
    #[must_use]
    pub fn expired(&self, retention: &RetentionConfiguration, now: DateTime<Utc>) -> Vec<TerminalRecord> {
        self.terminal_records()
            .into_iter()
            .filter(|record| record.is_expired(retention, now))
            .collect()
    }

    /// Delete a terminal message. This is the only way a record goes away.
    ///
    /// # Errors
    ///
    /// Fails if the message is unknown or not terminal.
    pub fn remove_terminal(&self, id: MessageId) -> Result<TerminalRecord, EngineError> {
        let state = self.state(id).ok_or(EngineError::UnknownMessage(id))?;

        self.records
            .remove_if(&id, |_, record| record.state.is_terminal())
            .and_then(|(_, record)| record.terminal())
            .ok_or(EngineError::InvalidTransition {
                id,
                state,
                event: "be removed",
            })
    }

    /// Attempt counts of messages that have been tried but are not terminal.
    #[must_use]
    pub fn progress(&self) -> Vec<(MessageId, u32)> {
        self.records
            .iter()
            .filter(|entry| !entry.state.is_terminal() && entry.attempts > 0)
            .map(|entry| (*entry.key(), entry.attempts))
            .collect()
    }

    /// Messages waiting for an attempt that could start at `now`.
    #[must_use]
    pub fn ready(&self, now: DateTime<Utc>) -> usize {
        self.records
            .iter()
            .filter(|entry| is_due(entry.value(), now))
            .count()
    }

    #[must_use]
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in &self.records {
            counts.record(entry.value().state);
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn terminal(record: &MessageRecord, at: DateTime<Utc>, outcome: TerminalOutcome) -> TerminalRecord {
    TerminalRecord {
        message_id: record.message.id,
        outcome,
        attempts: record.attempts,
        terminal_at: at,
        last_error: record.last_error.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{sync::Barrier, time::Duration};

    use chrono::TimeZone;

    use super::*;
    use crate::types::{Payload, Submission};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn message() -> Message {
        Submission::new("recipient", "service", "event", Payload::post("http://localhost/", "{}"))
            .into_message(MessageId::generate(), t0())
    }

    fn sequence(intervals: &[u64], max_attempts: u32) -> EffectivePolicy {
        EffectivePolicy::Sequence {
            intervals: angler_common::time::DurationSequence::new(
                intervals.iter().map(|m| Duration::from_secs(m * 60)).collect(),
            )
            .unwrap(),
            max_attempts,
        }
    }

    fn fail() -> AttemptOutcome {
        AttemptOutcome::Failure("HTTP 503".to_string())
    }

    #[test]
    fn test_every_attempt_fails_until_dead() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1, 5], 5));

        let mut now = t0();
        let mut attempt_times = Vec::new();
        let transition = loop {
            let ticket = machine.begin_attempt(id, now).unwrap();
            attempt_times.push(now);
            assert_eq!(machine.state(id), Some(MessageState::Attempting));

            match machine.complete_attempt(id, fail(), now).unwrap() {
                Transition::Retry { due, attempts } => {
                    assert_eq!(attempts, ticket.attempt);
                    assert!(machine.begin_attempt(id, due - minutes(1) / 2).is_err());
                    now = due;
                }
                transition => break transition,
            }
        };

        let gaps: Vec<_> = attempt_times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![minutes(1), minutes(5), minutes(5), minutes(5)]);

        let Transition::Dead(record) = transition else {
            unreachable!("expected the message to die");
        };
        assert_eq!(record.attempts, 5);
        assert_eq!(record.outcome, TerminalOutcome::Dead);
        assert_eq!(record.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(machine.state(id), Some(MessageState::Dead));
    }

    #[test]
    fn test_no_retry_dies_on_first_failure() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), EffectivePolicy::NoRetry);

        machine.begin_attempt(id, t0()).unwrap();
        let transition = machine
            .complete_attempt(id, AttemptOutcome::Timeout, t0())
            .unwrap();

        let Transition::Dead(record) = transition else {
            unreachable!("expected the message to die");
        };
        assert_eq!(record.attempts, 1);
        assert!(machine.begin_attempt(id, t0() + minutes(60)).is_err());
    }

    #[test]
    fn test_success_is_terminal() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1], 3));

        machine.begin_attempt(id, t0()).unwrap();
        let transition = machine
            .complete_attempt(id, AttemptOutcome::Success, t0())
            .unwrap();
        assert!(matches!(transition, Transition::Delivered(_)));

        assert_eq!(
            machine.begin_attempt(id, t0()).unwrap_err(),
            EngineError::AlreadyTerminal {
                id,
                state: MessageState::Delivered
            }
        );
        assert!(machine.complete_attempt(id, fail(), t0()).is_err());
    }

    #[test]
    fn test_next_due_only_while_pending_retry() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1], 3));
        assert_eq!(machine.get(id).unwrap().next_due, None);

        machine.begin_attempt(id, t0()).unwrap();
        assert_eq!(machine.get(id).unwrap().next_due, None);

        machine.complete_attempt(id, fail(), t0()).unwrap();
        assert_eq!(machine.get(id).unwrap().next_due, Some(t0() + minutes(1)));

        machine.begin_attempt(id, t0() + minutes(1)).unwrap();
        assert_eq!(machine.get(id).unwrap().next_due, None);
    }

    #[test]
    fn test_complete_requires_attempting() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), EffectivePolicy::NoRetry);

        assert!(matches!(
            machine.complete_attempt(id, AttemptOutcome::Success, t0()),
            Err(EngineError::InvalidTransition {
                state: MessageState::Pending,
                ..
            })
        ));

        let unknown = MessageId::generate();
        assert_eq!(
            machine.begin_attempt(unknown, t0()).unwrap_err(),
            EngineError::UnknownMessage(unknown)
        );
    }

    #[test]
    fn test_only_one_concurrent_attempt_wins() {
        let machine = Arc::new(MessageStateMachine::new());
        let id = machine.enqueue(message(), sequence(&[1], 3));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&machine);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    machine.begin_attempt(id, t0()).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(machine.get(id).unwrap().attempts, 1);
    }

    #[test]
    fn test_dispatch_and_release() {
        let machine = MessageStateMachine::new();
        let ids: Vec<_> = (0..3)
            .map(|_| machine.enqueue(message(), sequence(&[1], 3)))
            .collect();
        let other = machine.enqueue(message(), sequence(&[1], 3));

        for id in &ids {
            let dispatched = machine.dispatch(*id, "broker-1", t0()).unwrap();
            assert_eq!(dispatched.attempts, 0);
            assert!(machine.begin_attempt(*id, t0()).is_err());
        }
        machine.dispatch(other, "broker-2", t0()).unwrap();

        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(machine.release_broker("broker-1"), expected);

        for id in &ids {
            let record = machine.get(*id).unwrap();
            assert_eq!(record.state, MessageState::Pending);
            assert_eq!(record.owner, None);
        }
        assert_eq!(machine.state(other), Some(MessageState::Dispatched));

        machine.release(other).unwrap();
        assert!(machine.release(other).is_err());
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1], 3));
        machine.dispatch(id, "broker-1", t0()).unwrap();

        let first = machine
            .confirm(id, TerminalOutcome::Delivered, 2, None, t0())
            .unwrap();
        assert!(matches!(first, Confirmation::Applied(_)));
        assert_eq!(first.record().attempts, 2);

        let second = machine
            .confirm(id, TerminalOutcome::Delivered, 2, None, t0() + minutes(5))
            .unwrap();
        assert_eq!(second, Confirmation::AlreadyApplied(first.record().clone()));
        assert_eq!(machine.counts().delivered, 1);

        assert_eq!(
            machine.confirm(id, TerminalOutcome::Dead, 3, Some("late".to_string()), t0()),
            Err(EngineError::AlreadyTerminal {
                id,
                state: MessageState::Delivered
            })
        );
    }

    #[test]
    fn test_late_confirmation_after_release_applies() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1], 3));
        machine.dispatch(id, "broker-1", t0()).unwrap();
        machine.release_broker("broker-1");

        let confirmation = machine
            .confirm(id, TerminalOutcome::Dead, 9, Some("HTTP 410".to_string()), t0())
            .unwrap();

        assert!(matches!(confirmation, Confirmation::Applied(_)));
        assert_eq!(confirmation.record().attempts, 3);
        assert_eq!(confirmation.record().last_error.as_deref(), Some("HTTP 410"));
        assert!(machine.dispatch(id, "broker-2", t0()).is_err());
    }

    #[test]
    fn test_accept_dispatched_leaves_an_attempt() {
        let machine = MessageStateMachine::new();
        let dispatched = DispatchedMessage {
            message: message(),
            policy: sequence(&[1], 3),
            attempts: 3,
        };
        let id = machine.accept_dispatched(dispatched.clone()).unwrap();

        let ticket = machine.begin_attempt(id, t0()).unwrap();
        assert_eq!(ticket.attempt, 3);

        // Receiving the same message again leaves the running attempt alone
        assert_eq!(machine.accept_dispatched(dispatched), None);
        assert_eq!(machine.state(id), Some(MessageState::Attempting));
    }

    #[test]
    fn test_reported_attempts_carry_over_to_next_dispatch() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1], 3));
        machine.dispatch(id, "broker-1", t0()).unwrap();

        assert!(matches!(
            machine.record_attempts(id, "broker-2", 1),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert_eq!(machine.record_attempts(id, "broker-1", 2).unwrap(), 2);
        assert_eq!(machine.record_attempts(id, "broker-1", 1).unwrap(), 2);
        assert_eq!(machine.record_attempts(id, "broker-1", 7).unwrap(), 3);

        machine.release_broker("broker-1");
        assert!(machine.record_attempts(id, "broker-1", 3).is_err());

        let dispatched = machine.dispatch(id, "broker-2", t0()).unwrap();
        assert_eq!(dispatched.attempts, 3);

        let elsewhere = MessageStateMachine::new();
        let id = elsewhere.accept_dispatched(dispatched).unwrap();
        assert_eq!(elsewhere.begin_attempt(id, t0()).unwrap().attempt, 3);
        let transition = elsewhere.complete_attempt(id, fail(), t0()).unwrap();
        assert!(matches!(transition, Transition::Dead(record) if record.attempts == 3));
    }

    #[test]
    fn test_dispatched_to_owner_only() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), sequence(&[1], 3));
        assert_eq!(machine.dispatched_to(id, "broker-1"), None);

        let dispatched = machine.dispatch(id, "broker-1", t0()).unwrap();
        assert_eq!(machine.dispatched_to(id, "broker-1"), Some(dispatched));
        assert_eq!(machine.dispatched_to(id, "broker-2"), None);
    }

    #[test]
    fn test_unrepresentable_retry_time_still_retries() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(
            message(),
            EffectivePolicy::Scalar {
                interval: Duration::from_secs(u64::MAX),
                max_attempts: 3,
            },
        );

        machine.begin_attempt(id, t0()).unwrap();
        let transition = machine.complete_attempt(id, fail(), t0()).unwrap();

        assert_eq!(
            transition,
            Transition::Retry {
                due: DateTime::<Utc>::MAX_UTC,
                attempts: 1
            }
        );
        assert_eq!(machine.state(id), Some(MessageState::PendingRetry));
    }

    #[test]
    fn test_progress_and_ready() {
        let machine = MessageStateMachine::new();
        let waiting = machine.enqueue(message(), sequence(&[5], 3));
        let retrying = machine.enqueue(message(), sequence(&[5], 3));

        machine.begin_attempt(retrying, t0()).unwrap();
        machine.complete_attempt(retrying, fail(), t0()).unwrap();

        assert_eq!(machine.progress(), vec![(retrying, 1)]);
        assert_eq!(machine.ready(t0()), 1);
        assert_eq!(machine.ready(t0() + minutes(5)), 2);
        assert_eq!(machine.state(waiting), Some(MessageState::Pending));
    }

    #[test]
    fn test_abandon_unstarted() {
        let machine = MessageStateMachine::new();
        let waiting = machine.enqueue(message(), sequence(&[1], 3));
        let running = machine.enqueue(message(), sequence(&[1], 3));
        machine.begin_attempt(running, t0()).unwrap();

        assert_eq!(machine.abandon_unstarted(), vec![waiting]);
        assert_eq!(machine.state(waiting), None);
        assert_eq!(machine.state(running), Some(MessageState::Attempting));
    }

    #[test]
    fn test_remove_terminal_only() {
        let machine = MessageStateMachine::new();
        let id = machine.enqueue(message(), EffectivePolicy::NoRetry);

        assert!(matches!(
            machine.remove_terminal(id),
            Err(EngineError::InvalidTransition { .. })
        ));

        machine.begin_attempt(id, t0()).unwrap();
        machine.complete_attempt(id, fail(), t0()).unwrap();

        let retention = RetentionConfiguration {
            dead_messages: Some(Duration::from_secs(3600)),
            delivered_messages: None,
        };
        assert!(machine.expired(&retention, t0()).is_empty());
        assert_eq!(machine.expired(&retention, t0() + minutes(60)).len(), 1);

        let record = machine.remove_terminal(id).unwrap();
        assert_eq!(record.outcome, TerminalOutcome::Dead);
        assert!(machine.is_empty());
        assert_eq!(
            machine.remove_terminal(id),
            Err(EngineError::UnknownMessage(id))
        );
    }
}
