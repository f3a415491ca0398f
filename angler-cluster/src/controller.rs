//! Controller role: the authority over every message in the cluster.
//!
//! The coordinator answers broker requests against the controller's
//! [`DeliveryProcessor`] and owns the broker registry. A broker that stops
//! sending health checks for longer than `cluster.requestTimeout` loses its
//! session and everything dispatched to it goes back to `PENDING`.

use std::{sync::Arc, time::Duration};

use angler_common::{Signal, config::ClusterConfiguration, internal};
use angler_delivery::{
    Confirmation, DeliveryProcessor, EngineError, MessageId, TerminalOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    auth::ClusterKey,
    protocol::{Command, Request, Response, ResponseCode, ResponsePayload},
    registry::{Admission, BrokerRegistry, RegistryError},
    server::RequestHandler,
};

/// Largest batch handed out by a single pull
pub const MAX_PULL: u32 = 256;

#[derive(Debug)]
pub struct ClusterCoordinator {
    processor: Arc<DeliveryProcessor>,
    registry: BrokerRegistry,
    key: Option<ClusterKey>,
    request_timeout: Duration,
}

impl ClusterCoordinator {
    #[must_use]
    pub fn new(processor: Arc<DeliveryProcessor>, config: &ClusterConfiguration) -> Self {
        Self {
            processor,
            registry: BrokerRegistry::new(config.request_timeout),
            key: ClusterKey::from_config(config.auth_key.as_deref()),
            request_timeout: config.request_timeout,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &BrokerRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn processor(&self) -> &Arc<DeliveryProcessor> {
        &self.processor
    }

    /// How often brokers should send a health check
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.request_timeout / 3
    }

    /// Handle a request as of `now`.
    pub fn handle(&self, request: Request, now: DateTime<Utc>) -> Response {
        let Request {
            broker_id,
            session,
            command,
            ..
        } = request;

        if let Command::Authenticate { id, auth_token } = command {
            return self.authenticate(&id, &auth_token, session.as_deref(), now);
        }

        if let Err(e) = self.registry.touch(&broker_id, session.as_deref(), now) {
            if let RegistryError::Expired(node) = &e {
                warn!(broker_id = %node.id, "Broker session expired");
                self.release(&node.id);
            }
            return Response::error(ResponseCode::NotAuthenticated, e.to_string());
        }

        match command {
            Command::Authenticate { .. } | Command::HealthCheck => Response::ok(),
            Command::ConfirmMessageSent {
                message_id,
                attempts,
            } => self.confirm(&broker_id, message_id, TerminalOutcome::Delivered, attempts, None),
            Command::ConfirmMessageDead {
                message_id,
                attempts,
                last_error,
            } => self.confirm(
                &broker_id,
                message_id,
                TerminalOutcome::Dead,
                attempts,
                last_error,
            ),
            Command::PullMessages { max, batch } => self.pull(&broker_id, max, batch),
            Command::ReportAttempts { attempts } => self.record_attempts(&broker_id, attempts),
            Command::Deauthenticate => self.deauthenticate(&broker_id, session.as_deref()),
        }
    }

    fn authenticate(
        &self,
        id: &str,
        auth_token: &str,
        session: Option<&str>,
        now: DateTime<Utc>,
    ) -> Response {
        let Some(key) = &self.key else {
            warn!(broker_id = id, "Broker authentication attempted without cluster.authKey");
            return Response::error(
                ResponseCode::ClusterAuthDisabled,
                "Cluster authentication is not configured",
            );
        };

        if !key.verify(auth_token) {
            warn!(broker_id = id, "Broker presented an invalid cluster key");
            return Response::error(ResponseCode::InvalidAuthKey, "Invalid cluster key");
        }

        match self.registry.authenticate(id, session, now) {
            Ok(admission) => {
                match &admission {
                    Admission::New { .. } => info!(broker_id = id, "Broker authenticated"),
                    Admission::Refreshed { .. } => debug!(broker_id = id, "Broker session refreshed"),
                    Admission::Replaced { .. } => {
                        warn!(broker_id = id, "Broker replaced an expired session");
                        self.release(id);
                    }
                }

                Response::new(
                    ResponseCode::Ok,
                    ResponsePayload::Session {
                        session: admission.session().to_string(),
                        heartbeat_interval_ms: u64::try_from(self.heartbeat_interval().as_millis())
                            .unwrap_or(u64::MAX),
                    },
                )
            }
            Err(e) => {
                warn!(broker_id = id, "Broker authentication rejected: {e}");
                Response::error(ResponseCode::DuplicateBrokerId, e.to_string())
            }
        }
    }

    fn confirm(
        &self,
        broker_id: &str,
        message_id: MessageId,
        outcome: TerminalOutcome,
        attempts: u32,
        last_error: Option<String>,
    ) -> Response {
        match self
            .processor
            .confirm(message_id, outcome, attempts, last_error)
        {
            Ok(Confirmation::Applied(_)) => {
                self.registry.untrack(message_id);
                debug!(broker_id, message_id = %message_id, ?outcome, "Confirmation applied");
                Response::ok()
            }
            Ok(Confirmation::AlreadyApplied(_)) => {
                self.registry.untrack(message_id);
                Response::new(ResponseCode::AlreadyApplied, ResponsePayload::Empty)
            }
            Err(e) => {
                warn!(broker_id, message_id = %message_id, "Confirmation rejected: {e}");
                Response::error(code_for(&e), e.to_string())
            }
        }
    }

    fn pull(&self, broker_id: &str, max: u32, batch: u64) -> Response {
        if let Some(ids) = self.registry.repeated_pull(broker_id, batch) {
            let messages = self.processor.redispatch(ids, broker_id);
            warn!(
                broker_id,
                batch,
                count = messages.len(),
                "Broker repeated a pull, resending its messages"
            );
            return Response::new(ResponseCode::Ok, ResponsePayload::Messages(messages));
        }

        let max = usize::try_from(max.min(MAX_PULL)).unwrap_or_default();
        let messages = self.processor.take_due(max, broker_id);
        self.registry.track(
            broker_id,
            batch,
            messages.iter().map(|dispatched| dispatched.message.id).collect(),
        );

        Response::new(ResponseCode::Ok, ResponsePayload::Messages(messages))
    }

    fn record_attempts(&self, broker_id: &str, attempts: Vec<(MessageId, u32)>) -> Response {
        for (message_id, count) in attempts {
            match self.processor.record_attempts(message_id, broker_id, count) {
                Ok(recorded) => {
                    debug!(broker_id, message_id = %message_id, attempts = recorded, "Attempts recorded");
                }
                Err(e) => debug!(broker_id, message_id = %message_id, "Attempt report ignored: {e}"),
            }
        }

        Response::ok()
    }

    fn deauthenticate(&self, broker_id: &str, session: Option<&str>) -> Response {
        match self.registry.deauthenticate(broker_id, session) {
            Ok(_) => {
                info!(broker_id, "Broker left the cluster");
                self.release(broker_id);
                Response::ok()
            }
            Err(e) => Response::error(ResponseCode::NotAuthenticated, e.to_string()),
        }
    }

    fn release(&self, broker_id: &str) -> Vec<MessageId> {
        self.processor.release_broker(broker_id)
    }

    /// Expire every broker whose health checks are overdue at `now`,
    /// returning the messages that went back to `PENDING`.
    pub fn reap(&self, now: DateTime<Utc>) -> Vec<MessageId> {
        self.registry
            .reap_overdue(now)
            .into_iter()
            .flat_map(|node| {
                warn!(
                    broker_id = %node.id,
                    in_flight = node.in_flight.len(),
                    "Broker unreachable"
                );
                self.release(&node.id)
            })
            .collect()
    }

    /// Run the liveness sweep every half `cluster.requestTimeout` until shutdown.
    pub async fn sweep(&self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut interval = tokio::time::interval((self.request_timeout / 2).max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let released = self.reap(Utc::now());
                    if !released.is_empty() {
                        internal!(level = WARN, count = released.len(), "Requeued messages from unreachable brokers");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Broker liveness sweep stopping");
                        }
                        Err(e) => error!("Broker sweep shutdown channel error: {e}"),
                    }
                    break;
                }
            }
        }
    }
}

const fn code_for(error: &EngineError) -> ResponseCode {
    match error {
        EngineError::UnknownMessage(_) => ResponseCode::UnknownMessage,
        EngineError::InvalidTransition { .. } => ResponseCode::InvalidTransition,
        EngineError::AlreadyTerminal { .. } => ResponseCode::AlreadyTerminal,
        EngineError::Policy(_) | EngineError::Transport(_) => ResponseCode::Internal,
    }
}

#[async_trait]
impl RequestHandler for ClusterCoordinator {
    async fn handle_request(&self, request: Request) -> Response {
        self.handle(request, Utc::now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use angler_common::config::Configuration;
    use angler_delivery::{
        DeliveryError, Deliverer, Message, MessageState, Payload, Submission,
    };

    use super::*;

    const KEY: &str = "cluster-secret";

    struct Never;

    #[async_trait]
    impl Deliverer for Never {
        async fn deliver(&self, _: &Message, _: u32) -> Result<(), DeliveryError> {
            Err(DeliveryError::Failure("not used".to_string()))
        }
    }

    fn coordinator() -> ClusterCoordinator {
        let mut config = Configuration::default();
        config.cluster.auth_key = Some(KEY.to_string());
        config.cluster.request_timeout = Duration::from_secs(9);
        let config = Arc::new(config);

        let processor =
            Arc::new(DeliveryProcessor::new(Arc::clone(&config), Arc::new(Never), None).unwrap());
        ClusterCoordinator::new(processor, &config.cluster)
    }

    fn authenticate(coordinator: &ClusterCoordinator, id: &str, now: DateTime<Utc>) -> String {
        let response = coordinator.handle(
            Request::new(
                id,
                None,
                Command::Authenticate {
                    id: id.to_string(),
                    auth_token: KEY.to_string(),
                },
            ),
            now,
        );
        let ResponsePayload::Session {
            session,
            heartbeat_interval_ms,
        } = response.payload
        else {
            panic!("expected a session, got {response:?}");
        };
        assert_eq!(heartbeat_interval_ms, 3000);
        session
    }

    fn submit(coordinator: &ClusterCoordinator) -> MessageId {
        coordinator
            .processor()
            .submit(Submission::new(
                "r",
                "s",
                "e",
                Payload::post("http://localhost/", "{}"),
            ))
            .unwrap()
            .0
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let coordinator = coordinator();
        let response = coordinator.handle(
            Request::new(
                "b1",
                None,
                Command::Authenticate {
                    id: "b1".to_string(),
                    auth_token: "guess".to_string(),
                },
            ),
            Utc::now(),
        );

        assert!(!response.success);
        assert_eq!(response.response_code(), Some(ResponseCode::InvalidAuthKey));
        assert!(coordinator.registry().is_empty());
    }

    #[test]
    fn test_requests_need_a_session() {
        let coordinator = coordinator();
        let response = coordinator.handle(
            Request::new("b1", None, Command::PullMessages { max: 10, batch: 1 }),
            Utc::now(),
        );
        assert_eq!(response.response_code(), Some(ResponseCode::NotAuthenticated));
    }

    #[test]
    fn test_auth_disabled_without_key() {
        let config = Arc::new(Configuration::default());
        let processor =
            Arc::new(DeliveryProcessor::new(Arc::clone(&config), Arc::new(Never), None).unwrap());
        let coordinator = ClusterCoordinator::new(processor, &config.cluster);

        let response = coordinator.handle(
            Request::new(
                "b1",
                None,
                Command::Authenticate {
                    id: "b1".to_string(),
                    auth_token: KEY.to_string(),
                },
            ),
            Utc::now(),
        );
        assert_eq!(response.response_code(), Some(ResponseCode::ClusterAuthDisabled));
    }

    #[test]
    fn test_pull_and_confirm() {
        let coordinator = coordinator();
        let now = Utc::now();
        let session = authenticate(&coordinator, "b1", now);
        let id = submit(&coordinator);

        let response = coordinator.handle(
            Request::new("b1", Some(session.clone()), Command::PullMessages { max: 10, batch: 1 }),
            now,
        );
        let ResponsePayload::Messages(messages) = response.payload else {
            panic!("expected messages");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.id, id);
        assert!(coordinator.registry().get("b1").unwrap().in_flight.contains(&id));

        let confirm = Command::ConfirmMessageSent {
            message_id: id,
            attempts: 2,
        };
        let response = coordinator.handle(Request::new("b1", Some(session.clone()), confirm.clone()), now);
        assert_eq!(response.response_code(), Some(ResponseCode::Ok));

        let response = coordinator.handle(Request::new("b1", Some(session.clone()), confirm), now);
        assert!(response.success);
        assert_eq!(response.response_code(), Some(ResponseCode::AlreadyApplied));

        let response = coordinator.handle(
            Request::new(
                "b1",
                Some(session),
                Command::ConfirmMessageDead {
                    message_id: id,
                    attempts: 2,
                    last_error: None,
                },
            ),
            now,
        );
        assert_eq!(response.response_code(), Some(ResponseCode::AlreadyTerminal));

        let record = coordinator.processor().machine().get(id).unwrap();
        assert_eq!(record.state, MessageState::Delivered);
        assert_eq!(record.attempts, 2);
        assert!(coordinator.registry().get("b1").unwrap().in_flight.is_empty());
    }

    #[test]
    fn test_unknown_message() {
        let coordinator = coordinator();
        let now = Utc::now();
        let session = authenticate(&coordinator, "b1", now);

        let response = coordinator.handle(
            Request::new(
                "b1",
                Some(session),
                Command::ConfirmMessageSent {
                    message_id: MessageId::generate(),
                    attempts: 1,
                },
            ),
            now,
        );
        assert_eq!(response.response_code(), Some(ResponseCode::UnknownMessage));
    }

    #[test]
    fn test_missed_heartbeats_requeue_messages() {
        let coordinator = coordinator();
        let t0 = Utc::now();
        let session = authenticate(&coordinator, "b1", t0);
        let ids: Vec<_> = (0..3).map(|_| submit(&coordinator)).collect();

        coordinator.handle(
            Request::new("b1", Some(session), Command::PullMessages { max: 10, batch: 1 }),
            t0,
        );
        for id in &ids {
            assert_eq!(
                coordinator.processor().machine().state(*id),
                Some(MessageState::Dispatched)
            );
        }

        assert!(coordinator.reap(t0 + chrono::Duration::seconds(5)).is_empty());

        let mut released = coordinator.reap(t0 + chrono::Duration::seconds(10));
        released.sort_unstable();
        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(released, expected);

        for id in &ids {
            assert_eq!(
                coordinator.processor().machine().state(*id),
                Some(MessageState::Pending)
            );
        }
        assert!(coordinator.registry().is_empty());
    }

    #[test]
    fn test_deauthenticate_returns_messages() {
        let coordinator = coordinator();
        let now = Utc::now();
        let session = authenticate(&coordinator, "b1", now);
        let id = submit(&coordinator);

        coordinator.handle(
            Request::new("b1", Some(session.clone()), Command::PullMessages { max: 1, batch: 1 }),
            now,
        );
        let response =
            coordinator.handle(Request::new("b1", Some(session), Command::Deauthenticate), now);

        assert!(response.success);
        assert_eq!(
            coordinator.processor().machine().state(id),
            Some(MessageState::Pending)
        );
    }

    fn pull(
        coordinator: &ClusterCoordinator,
        id: &str,
        session: &str,
        batch: u64,
        now: DateTime<Utc>,
    ) -> Vec<MessageId> {
        let response = coordinator.handle(
            Request::new(
                id,
                Some(session.to_string()),
                Command::PullMessages { max: 10, batch },
            ),
            now,
        );
        let ResponsePayload::Messages(messages) = response.payload else {
            panic!("expected messages, got {response:?}");
        };
        messages.into_iter().map(|dispatched| dispatched.message.id).collect()
    }

    #[test]
    fn test_repeated_pull_resends_its_batch() {
        let coordinator = coordinator();
        let now = Utc::now();
        let session = authenticate(&coordinator, "b1", now);
        let first = submit(&coordinator);

        assert_eq!(pull(&coordinator, "b1", &session, 1, now), vec![first]);

        let second = submit(&coordinator);
        assert_eq!(pull(&coordinator, "b1", &session, 1, now), vec![first]);
        assert_eq!(
            coordinator.processor().machine().state(second),
            Some(MessageState::Pending)
        );

        assert_eq!(pull(&coordinator, "b1", &session, 2, now), vec![second]);
        assert!(pull(&coordinator, "b1", &session, 3, now).is_empty());
    }

    #[test]
    fn test_attempts_survive_a_lost_broker() {
        let coordinator = coordinator();
        let t0 = Utc::now();
        let session = authenticate(&coordinator, "b1", t0);
        let id = coordinator
            .processor()
            .submit(
                Submission::new("r", "s", "e", Payload::post("http://localhost/", "{}"))
                    .with_retry_policy(Some("1m"), Some(3)),
            )
            .unwrap()
            .0;
        pull(&coordinator, "b1", &session, 1, t0);

        let response = coordinator.handle(
            Request::new(
                "b1",
                Some(session),
                Command::ReportAttempts {
                    attempts: vec![(id, 2), (MessageId::generate(), 1)],
                },
            ),
            t0,
        );
        assert_eq!(response.response_code(), Some(ResponseCode::Ok));
        assert_eq!(coordinator.processor().machine().get(id).unwrap().attempts, 2);

        assert_eq!(coordinator.reap(t0 + chrono::Duration::seconds(10)), vec![id]);

        let later = t0 + chrono::Duration::seconds(11);
        let session = authenticate(&coordinator, "b2", later);
        let response = coordinator.handle(
            Request::new("b2", Some(session), Command::PullMessages { max: 10, batch: 1 }),
            later,
        );
        let ResponsePayload::Messages(messages) = response.payload else {
            panic!("expected messages");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attempts, 2);
        assert_eq!(messages[0].policy.max_attempts(), 3);
    }
}
