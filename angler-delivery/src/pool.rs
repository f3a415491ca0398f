//! Concurrent delivery workers

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use angler_common::{Signal, internal};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::{sync::broadcast, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    client::Deliverer,
    error::DeliveryError,
    machine::{MessageStateMachine, Transition},
    queue::DueQueue,
    types::{AttemptOutcome, DeliveryAttempt, MessageId, TerminalRecord},
};

/// Receives every terminal outcome produced by the pool.
pub trait OutcomeListener: Send + Sync {
    fn on_terminal(&self, record: &TerminalRecord);
}

impl From<Result<(), DeliveryError>> for AttemptOutcome {
    fn from(result: Result<(), DeliveryError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(DeliveryError::Timeout(_)) => Self::Timeout,
            Err(DeliveryError::Failure(reason) | DeliveryError::Fault(reason)) => {
                Self::Failure(reason)
            }
        }
    }
}

/// A fixed number of workers pulling due messages off a shared queue.
///
/// A message is attempted by at most one worker at a time: the pool tracks
/// in-flight IDs, and the state machine refuses to hand out a message that is
/// not waiting for an attempt.
pub struct DeliveryWorkerPool {
    workers: usize,
    timeout: Duration,
    deliverer: Arc<dyn Deliverer>,
    machine: Arc<MessageStateMachine>,
    queue: Arc<DueQueue>,
    listener: Option<Arc<dyn OutcomeListener>>,
    in_flight: DashSet<MessageId>,
    busy: AtomicUsize,
}

impl std::fmt::Debug for DeliveryWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorkerPool")
            .field("workers", &self.workers)
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl DeliveryWorkerPool {
    /// `workers` is raised to at least one.
    #[must_use]
    pub fn new(
        workers: usize,
        timeout: Duration,
        deliverer: Arc<dyn Deliverer>,
        machine: Arc<MessageStateMachine>,
        queue: Arc<DueQueue>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            timeout,
            deliverer,
            machine,
            queue,
            listener: None,
            in_flight: DashSet::new(),
            busy: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn OutcomeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Workers not currently running an attempt.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.workers.saturating_sub(self.busy.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Hand a message to the pool, to be attempted once `due`.
    pub fn submit(&self, id: MessageId, due: DateTime<Utc>) {
        self.queue.push(id, due);
    }

    /// Run the workers until a shutdown signal arrives.
    ///
    /// Attempts already running are allowed to finish (each is bounded by the
    /// attempt timeout) before this returns.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, workers = self.workers, "Delivery workers starting");

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.resubscribe();
            workers.spawn(async move { pool.work(worker, shutdown).await });
        }

        match shutdown.recv().await {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!("Delivery workers received shutdown signal");
            }
            Err(e) => error!("Delivery worker shutdown channel error: {e}"),
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Delivery worker exited abnormally: {e}");
            }
        }

        internal!(level = INFO, "Delivery workers stopped");
    }

    async fn work(&self, worker: usize, mut shutdown: broadcast::Receiver<Signal>) {
        loop {
            tokio::select! {
                id = self.queue.next() => {
                    self.attempt(id).await;
                }
                _ = shutdown.recv() => {
                    debug!(worker, "Delivery worker stopping");
                    break;
                }
            }
        }
    }

    /// Run one attempt for `id` and apply its outcome.
    ///
    /// Returns `None` if the message was not eligible for an attempt.
    pub async fn attempt(&self, id: MessageId) -> Option<Transition> {
        if !self.in_flight.insert(id) {
            debug!(message_id = %id, "Attempt already in flight, skipping");
            return None;
        }

        self.busy.fetch_add(1, Ordering::AcqRel);
        let transition = self.run(id).await;
        self.busy.fetch_sub(1, Ordering::AcqRel);
        self.in_flight.remove(&id);

        match &transition {
            Some(Transition::Retry { due, .. }) => self.queue.push(id, *due),
            Some(transition) => {
                if let (Some(listener), Some(record)) = (&self.listener, transition.terminal()) {
                    listener.on_terminal(record);
                }
            }
            None => {}
        }

        transition
    }

    async fn run(&self, id: MessageId) -> Option<Transition> {
        let ticket = match self.machine.begin_attempt(id, Utc::now()) {
            Ok(ticket) => ticket,
            Err(e) => {
                debug!(message_id = %id, "Skipping attempt: {e}");
                return None;
            }
        };

        info!(message_id = %id, attempt = ticket.attempt, "Delivery attempt started");

        let started_at = Utc::now();
        let clock = Instant::now();
        let deliverer = Arc::clone(&self.deliverer);
        let message = Arc::clone(&ticket.message);
        let attempt = ticket.attempt;

        let mut handle =
            tokio::spawn(async move { deliverer.deliver(&message, attempt).await });

        let result = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DeliveryError::from(join_error)),
            Err(_) => {
                handle.abort();
                Err(DeliveryError::Timeout(self.timeout))
            }
        };

        let record = DeliveryAttempt {
            message_id: id,
            attempt,
            started_at,
            outcome: result.into(),
            duration: clock.elapsed(),
        };

        match &record.outcome {
            AttemptOutcome::Success => info!(
                message_id = %id,
                attempt,
                duration_ms = record.duration.as_millis(),
                "Delivery attempt succeeded"
            ),
            outcome => warn!(
                message_id = %id,
                attempt,
                duration_ms = record.duration.as_millis(),
                outcome = %outcome,
                "Delivery attempt failed"
            ),
        }

        match self.machine.complete_attempt(id, record.outcome, Utc::now()) {
            Ok(transition) => Some(transition),
            Err(e) => {
                warn!(message_id = %id, "Attempt outcome discarded: {e}");
                None
            }
        }
    }
}
