//! The delivery engine as one unit: ingestion, scheduling and workers.

use std::sync::Arc;

use angler_common::{Signal, config::Configuration, incoming, internal};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    client::Deliverer,
    error::{EngineError, PolicyError},
    machine::{Confirmation, MessageStateMachine},
    policy::{RetryPolicy, RetryPolicyEngine},
    pool::{DeliveryWorkerPool, OutcomeListener},
    queue::DueQueue,
    transport::TransportSet,
    types::{
        DispatchedMessage, MessageId, MessageState, StateCounts, Submission, TerminalOutcome,
        TerminalRecord,
    },
};

#[derive(Debug)]
pub struct DeliveryProcessor {
    machine: Arc<MessageStateMachine>,
    queue: Arc<DueQueue>,
    policies: RetryPolicyEngine,
    transports: TransportSet,
    pool: Arc<DeliveryWorkerPool>,
    config: Arc<Configuration>,
}

impl DeliveryProcessor {
    /// # Errors
    ///
    /// Fails if the configured retry policy defaults or limits are invalid.
    pub fn new(
        config: Arc<Configuration>,
        deliverer: Arc<dyn Deliverer>,
        listener: Option<Arc<dyn OutcomeListener>>,
    ) -> Result<Self, PolicyError> {
        let policies = RetryPolicyEngine::from_config(&config.retry_policy)?;
        let machine = Arc::new(MessageStateMachine::new());
        let queue = Arc::new(DueQueue::new());

        let mut pool = DeliveryWorkerPool::new(
            config.messages_processor.workers,
            config.messages_processor.message_delivery_timeout,
            deliverer,
            Arc::clone(&machine),
            Arc::clone(&queue),
        );
        if let Some(listener) = listener {
            pool = pool.with_listener(listener);
        }

        Ok(Self {
            machine,
            queue,
            policies,
            transports: TransportSet::from_protocols(&config.networking.client_protocols),
            pool: Arc::new(pool),
            config,
        })
    }

    /// Accept a new message.
    ///
    /// The retry policy is validated and resolved here, so a bad policy is
    /// rejected before the message exists.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Policy`] if the requested retry policy is invalid.
    pub fn submit(&self, submission: Submission) -> Result<(MessageId, MessageState), EngineError> {
        self.submit_at(submission, Utc::now())
    }

    fn submit_at(
        &self,
        submission: Submission,
        now: DateTime<Utc>,
    ) -> Result<(MessageId, MessageState), EngineError> {
        let requested = submission
            .retry_policy
            .as_ref()
            .map(RetryPolicy::from_requested)
            .transpose()?;
        let policy = self.policies.resolve(requested.as_ref())?;

        let message = submission.into_message(MessageId::generate(), now);
        incoming!(
            level = INFO,
            message_id = %message.id,
            recipient_id = %message.recipient_id,
            event_id = %message.event_id,
            policy = %policy,
            "Message accepted"
        );

        let id = self.machine.enqueue(message, policy);
        self.queue.push(id, now);

        Ok((id, MessageState::Pending))
    }

    /// Decode a raw client request with the named transport and accept it.
    ///
    /// # Errors
    ///
    /// Fails if the protocol is not enabled, the request is malformed, or its
    /// retry policy is invalid.
    pub fn submit_raw(
        &self,
        protocol: &str,
        raw: &[u8],
    ) -> Result<(MessageId, MessageState), EngineError> {
        let submission = self.transports.decode(protocol, raw)?;
        self.submit(submission)
    }

    /// Run the local workers until shutdown.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) {
        Arc::clone(&self.pool).serve(shutdown).await;
    }

    /// Check out up to `max` due messages to `broker_id`.
    pub fn take_due(&self, max: usize, broker_id: &str) -> Vec<DispatchedMessage> {
        let now = Utc::now();
        let mut dispatched = Vec::with_capacity(max);

        while dispatched.len() < max {
            let ids = self.queue.try_pop_due(max - dispatched.len(), now);
            if ids.is_empty() {
                break;
            }

            for id in ids {
                match self.machine.dispatch(id, broker_id, now) {
                    Ok(message) => dispatched.push(message),
                    Err(e) => debug!(message_id = %id, "Not dispatching: {e}"),
                }
            }
        }

        if !dispatched.is_empty() {
            internal!(
                level = DEBUG,
                broker_id,
                count = dispatched.len(),
                "Messages dispatched"
            );
        }

        dispatched
    }

    /// Messages from `ids` that are still checked out to `broker_id`.
    pub fn redispatch(
        &self,
        ids: impl IntoIterator<Item = MessageId>,
        broker_id: &str,
    ) -> Vec<DispatchedMessage> {
        ids.into_iter()
            .filter_map(|id| self.machine.dispatched_to(id, broker_id))
            .collect()
    }

    /// Take over a message checked out to this node by a controller.
    ///
    /// Returns `None` if the message is already known here.
    pub fn accept_dispatched(&self, dispatched: DispatchedMessage) -> Option<MessageId> {
        let id = self.machine.accept_dispatched(dispatched)?;
        self.queue.push(id, Utc::now());
        Some(id)
    }

    /// Merge attempts a broker made on a message dispatched to it.
    ///
    /// # Errors
    ///
    /// See [`MessageStateMachine::record_attempts`].
    pub fn record_attempts(
        &self,
        id: MessageId,
        broker_id: &str,
        attempts: u32,
    ) -> Result<u32, EngineError> {
        self.machine.record_attempts(id, broker_id, attempts)
    }

    /// Return everything dispatched to `broker_id` to the queue.
    pub fn release_broker(&self, broker_id: &str) -> Vec<MessageId> {
        let released = self.machine.release_broker(broker_id);
        let now = Utc::now();
        for id in &released {
            self.queue.push(*id, now);
        }

        if !released.is_empty() {
            internal!(
                level = WARN,
                broker_id,
                count = released.len(),
                "Released messages from broker"
            );
        }

        released
    }

    /// Apply a terminal outcome reported by a broker.
    ///
    /// # Errors
    ///
    /// See [`MessageStateMachine::confirm`].
    pub fn confirm(
        &self,
        id: MessageId,
        outcome: TerminalOutcome,
        attempts: u32,
        last_error: Option<String>,
    ) -> Result<Confirmation, EngineError> {
        self.machine
            .confirm(id, outcome, attempts, last_error, Utc::now())
    }

    /// Drop all local work that has not started yet.
    pub fn abandon_unstarted(&self) -> Vec<MessageId> {
        let abandoned = self.machine.abandon_unstarted();
        if !abandoned.is_empty() {
            internal!(
                level = WARN,
                count = abandoned.len(),
                "Abandoned messages not yet attempted"
            );
        }
        abandoned
    }

    /// Remove terminal messages whose retention window has elapsed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<TerminalRecord> {
        self.machine
            .expired(&self.config.retention, now)
            .into_iter()
            .filter_map(|record| self.machine.remove_terminal(record.message_id).ok())
            .collect()
    }

    /// How many more messages this node could start right now.
    ///
    /// Retries scheduled for later do not occupy a worker until they are due.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let counts = self.stats();
        self.pool
            .workers()
            .saturating_sub(counts.attempting + self.machine.ready(Utc::now()))
    }

    #[must_use]
    pub fn stats(&self) -> StateCounts {
        self.machine.counts()
    }

    #[must_use]
    pub const fn machine(&self) -> &Arc<MessageStateMachine> {
        &self.machine
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<DeliveryWorkerPool> {
        &self.pool
    }

    #[must_use]
    pub const fn policies(&self) -> &RetryPolicyEngine {
        &self.policies
    }

    #[must_use]
    pub const fn transports(&self) -> &TransportSet {
        &self.transports
    }

    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }
}
