//! Broker role: a worker node delivering on the controller's behalf.
//!
//! The broker runs its own [`DeliveryProcessor`] against messages the
//! controller dispatched to it. Retries are decided locally. Attempt counts
//! of messages still retrying are reported as they change, and terminal
//! outcomes travel back through an [`Outbox`] that is drained until the
//! controller acknowledges every entry.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use angler_common::{Signal, config::Configuration, outgoing};
use angler_delivery::{
    Deliverer, DeliveryProcessor, MessageId, OutcomeListener, TerminalOutcome, TerminalRecord,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, info, warn};

use crate::{
    ClusterError, Result,
    client::ClusterClient,
    protocol::{Command, Request, ResponseCode, ResponsePayload},
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Terminal outcomes waiting to be acknowledged by the controller
#[derive(Debug, Default)]
pub struct Outbox {
    records: Mutex<VecDeque<TerminalRecord>>,
    notify: Notify,
}

impl Outbox {
    pub fn push(&self, record: TerminalRecord) {
        self.records.lock().push_back(record);
        self.notify.notify_one();
    }

    #[must_use]
    pub fn front(&self) -> Option<TerminalRecord> {
        self.records.lock().front().cloned()
    }

    /// Drop the front entry once it has been acknowledged.
    fn acknowledge(&self, record: &TerminalRecord) {
        let mut records = self.records.lock();
        if records
            .front()
            .is_some_and(|front| front.message_id == record.message_id)
        {
            records.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Wait until something is pushed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl OutcomeListener for Outbox {
    fn on_terminal(&self, record: &TerminalRecord) {
        self.push(record.clone());
    }
}

/// Capped exponential backoff with ±20% jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);

        let base = self.initial.saturating_mul(1 << exponent).min(self.max);
        let jitter: f64 = rand::rng().random_range(0.8..=1.2);
        base.mul_f64(jitter).min(self.max)
    }

    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct Broker {
    id: String,
    auth_key: String,
    client: ClusterClient,
    processor: Arc<DeliveryProcessor>,
    outbox: Arc<Outbox>,
    session: Mutex<Option<String>>,
    authenticated: AtomicBool,
    heartbeat_interval: Mutex<Duration>,
    last_heartbeat: Mutex<Instant>,
    poll_interval: Duration,
    /// Number of the next pull; only advances once a pull is answered
    pull_batch: AtomicU64,
    /// Attempt counts the controller has acknowledged
    reported: Mutex<HashMap<MessageId, u32>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("controller", &self.client.addr())
            .field("authenticated", &self.is_authenticated())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// # Errors
    ///
    /// Returns [`ClusterError::AuthKeyMissing`] without `cluster.authKey`, or
    /// a policy error if the retry configuration is invalid.
    pub fn new(
        id: impl Into<String>,
        config: Arc<Configuration>,
        deliverer: Arc<dyn Deliverer>,
    ) -> Result<Self> {
        let auth_key = config
            .cluster
            .auth_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or(ClusterError::AuthKeyMissing)?;

        let outbox = Arc::new(Outbox::default());
        let listener: Arc<dyn OutcomeListener> = Arc::clone(&outbox) as _;
        let processor = Arc::new(DeliveryProcessor::new(
            Arc::clone(&config),
            deliverer,
            Some(listener),
        )?);

        let request_timeout = config.cluster.request_timeout;
        Ok(Self {
            id: id.into(),
            auth_key,
            client: ClusterClient::new(config.cluster.controller_host.clone())
                .with_timeout(request_timeout),
            processor,
            outbox,
            session: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            heartbeat_interval: Mutex::new(request_timeout / 3),
            last_heartbeat: Mutex::new(Instant::now()),
            poll_interval: POLL_INTERVAL,
            pull_batch: AtomicU64::new(1),
            reported: Mutex::new(HashMap::new()),
        })
    }

    /// How often to ask the controller for work
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn processor(&self) -> &Arc<DeliveryProcessor> {
        &self.processor
    }

    #[must_use]
    pub const fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    #[must_use]
    pub fn session(&self) -> Option<String> {
        self.session.lock().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn request(&self, command: Command) -> Request {
        Request::new(self.id.clone(), self.session(), command)
    }

    /// Join the cluster, presenting the current session if there is one.
    ///
    /// Local work that has not started is dropped whenever the controller
    /// hands out a different session.
    ///
    /// # Errors
    ///
    /// Returns the rejection if the key is wrong or the ID is taken.
    pub async fn authenticate(&self) -> Result<()> {
        let previous = self.session();
        let response = self
            .client
            .call(Request::new(
                self.id.clone(),
                previous.clone(),
                Command::Authenticate {
                    id: self.id.clone(),
                    auth_token: self.auth_key.clone(),
                },
            ))
            .await?;

        let ResponsePayload::Session {
            session,
            heartbeat_interval_ms,
        } = response.payload
        else {
            return Err(ClusterError::UnexpectedResponse("Authenticate"));
        };

        if previous.as_deref() != Some(session.as_str()) {
            self.reported.lock().clear();
            let abandoned = self.processor.abandon_unstarted();
            if previous.is_some() {
                warn!(
                    broker_id = %self.id,
                    abandoned = abandoned.len(),
                    "Controller issued a new session"
                );
            }
        }

        *self.session.lock() = Some(session);
        *self.heartbeat_interval.lock() = Duration::from_millis(heartbeat_interval_ms);
        *self.last_heartbeat.lock() = Instant::now();
        self.authenticated.store(true, Ordering::Release);

        info!(broker_id = %self.id, controller = self.client.addr(), "Authenticated with controller");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the controller cannot be reached or has dropped
    /// this broker's session.
    pub async fn heartbeat(&self) -> Result<()> {
        self.client.call(self.request(Command::HealthCheck)).await?;
        *self.last_heartbeat.lock() = Instant::now();
        Ok(())
    }

    fn heartbeat_due(&self) -> bool {
        self.last_heartbeat.lock().elapsed() >= *self.heartbeat_interval.lock()
    }

    /// Relay queued terminal outcomes, oldest first, returning how many the
    /// controller acknowledged.
    ///
    /// # Errors
    ///
    /// Stops at the first entry that could not be delivered to the
    /// controller; it stays queued.
    pub async fn flush_outbox(&self) -> Result<usize> {
        let mut acknowledged = 0;

        while let Some(record) = self.outbox.front() {
            let command = match record.outcome {
                TerminalOutcome::Delivered => Command::ConfirmMessageSent {
                    message_id: record.message_id,
                    attempts: record.attempts,
                },
                TerminalOutcome::Dead => Command::ConfirmMessageDead {
                    message_id: record.message_id,
                    attempts: record.attempts,
                    last_error: record.last_error.clone(),
                },
            };

            outgoing!(
                message_id = %record.message_id,
                outcome = ?record.outcome,
                "Confirming terminal outcome"
            );

            match self.client.call(self.request(command)).await {
                Ok(_) => acknowledged += 1,
                Err(e)
                    if matches!(
                        e.code(),
                        Some(
                            ResponseCode::UnknownMessage
                                | ResponseCode::AlreadyTerminal
                                | ResponseCode::InvalidTransition
                        )
                    ) =>
                {
                    warn!(message_id = %record.message_id, "Controller refused confirmation: {e}");
                }
                Err(e) => return Err(e),
            }

            self.outbox.acknowledge(&record);
            if let Err(e) = self.processor.machine().remove_terminal(record.message_id) {
                debug!(message_id = %record.message_id, "Confirmed message already gone: {e}");
            }
        }

        Ok(acknowledged)
    }

    /// Report attempt counts that changed since the last report, returning
    /// how many were sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller cannot be reached or has dropped
    /// this broker's session. The counts are sent again next time.
    pub async fn report_attempts(&self) -> Result<usize> {
        let progress = self.processor.machine().progress();
        let changed: Vec<_> = {
            let reported = self.reported.lock();
            progress
                .iter()
                .filter(|(id, attempts)| reported.get(id) != Some(attempts))
                .copied()
                .collect()
        };

        if changed.is_empty() {
            return Ok(0);
        }

        let count = changed.len();
        self.client
            .call(self.request(Command::ReportAttempts { attempts: changed }))
            .await?;

        *self.reported.lock() = progress.into_iter().collect();
        *self.last_heartbeat.lock() = Instant::now();
        Ok(count)
    }

    /// Fetch as many messages as there are free workers.
    ///
    /// A pull that gets no answer is repeated with the same batch number, so
    /// the controller hands out what it already checked out to this broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller cannot be reached or has dropped
    /// this broker's session.
    pub async fn pull(&self) -> Result<usize> {
        let capacity = self.processor.capacity();
        if capacity == 0 {
            return Ok(0);
        }

        let max = u32::try_from(capacity).unwrap_or(u32::MAX);
        let batch = self.pull_batch.load(Ordering::Acquire);
        let response = self
            .client
            .call(self.request(Command::PullMessages { max, batch }))
            .await?;

        let ResponsePayload::Messages(messages) = response.payload else {
            return Err(ClusterError::UnexpectedResponse("PullMessages"));
        };
        self.pull_batch.fetch_add(1, Ordering::AcqRel);

        let count = messages.len();
        for dispatched in messages {
            let id = dispatched.message.id;
            if self.processor.accept_dispatched(dispatched).is_some() {
                debug!(message_id = %id, broker_id = %self.id, batch, "Accepted dispatched message");
            }
        }

        Ok(count)
    }

    /// Leave the cluster. The controller returns anything still dispatched
    /// to this broker to `PENDING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller cannot be reached.
    pub async fn deauthenticate(&self) -> Result<()> {
        let result = self.client.call(self.request(Command::Deauthenticate)).await;
        self.authenticated.store(false, Ordering::Release);
        *self.session.lock() = None;
        self.client.disconnect().await;
        result.map(|_| ())
    }

    async fn cycle(&self) -> Result<()> {
        self.flush_outbox().await?;
        self.report_attempts().await?;
        if self.heartbeat_due() {
            self.heartbeat().await?;
        }
        self.pull().await?;
        Ok(())
    }

    fn on_error(&self, error: &ClusterError) {
        self.authenticated.store(false, Ordering::Release);

        if error.is_session_lost() {
            *self.session.lock() = None;
            self.reported.lock().clear();
            let abandoned = self.processor.abandon_unstarted();
            warn!(
                broker_id = %self.id,
                abandoned = abandoned.len(),
                "Lost session with controller: {error}"
            );
        } else {
            warn!(broker_id = %self.id, "Controller request failed: {error}");
        }
    }

    /// Run the local workers and the controller loop until shutdown.
    ///
    /// On shutdown, running attempts finish, their outcomes are relayed and
    /// the broker deauthenticates.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let workers = {
            let processor = Arc::clone(&self.processor);
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move { processor.serve(shutdown).await })
        };

        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);

        loop {
            let delay = if self.is_authenticated() {
                match self.cycle().await {
                    Ok(()) => self.poll_interval,
                    Err(e) => {
                        self.on_error(&e);
                        Duration::ZERO
                    }
                }
            } else {
                match self.authenticate().await {
                    Ok(()) => {
                        backoff.reset();
                        Duration::ZERO
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            broker_id = %self.id,
                            retry_ms = delay.as_millis(),
                            "Authentication failed: {e}"
                        );
                        delay
                    }
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.outbox.notified(), if self.is_authenticated() => {}
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!(broker_id = %self.id, "Broker shutting down");
                        }
                        Err(e) => error!("Broker shutdown channel error: {e}"),
                    }
                    break;
                }
            }
        }

        if let Err(e) = workers.await {
            error!("Broker workers failed: {e}");
        }

        if self.is_authenticated() {
            if let Err(e) = self.flush_outbox().await {
                warn!(pending = self.outbox.len(), "Could not relay outcomes before shutdown: {e}");
            }
            if let Err(e) = self.deauthenticate().await {
                warn!("Could not deauthenticate from controller: {e}");
            }
        }
    }
}
