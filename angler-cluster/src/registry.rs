//! Membership of brokers known to the controller

use std::{collections::BTreeSet, time::Duration};

use angler_delivery::MessageId;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;

use crate::auth::new_session;

/// Authentication state of a broker as seen from either side of the protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrokerState {
    #[default]
    Unauthenticated,
    Authenticated,
}

/// An authenticated broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerNode {
    pub id: String,
    pub state: BrokerState,
    pub session: String,
    pub last_health_check: DateTime<Utc>,
    /// Messages dispatched to this broker and not yet confirmed
    pub in_flight: BTreeSet<MessageId>,
    /// Number and contents of the last pull answered for this session
    pub last_pull: Option<(u64, Vec<MessageId>)>,
}

impl BrokerNode {
    fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            state: BrokerState::Authenticated,
            session: new_session(),
            last_health_check: now,
            in_flight: BTreeSet::new(),
            last_pull: None,
        }
    }

    #[must_use]
    pub fn is_overdue(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| self.last_health_check.checked_add_signed(timeout))
            .is_some_and(|deadline| deadline < now)
    }
}

/// How an authentication was admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First session for this ID
    New { session: String },
    /// The broker presented its live session; it was kept and refreshed
    Refreshed { session: String },
    /// An overdue session for this ID was replaced
    Replaced { session: String, previous: BrokerNode },
}

impl Admission {
    #[must_use]
    pub fn session(&self) -> &str {
        match self {
            Self::New { session } | Self::Refreshed { session } | Self::Replaced { session, .. } => {
                session
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Broker {0} is already connected")]
    DuplicateBrokerId(String),

    #[error("Broker {0} is not authenticated")]
    NotAuthenticated(String),

    /// The session existed but its heartbeat was overdue; the node was removed
    #[error("Broker {} missed its health checks", .0.id)]
    Expired(Box<BrokerNode>),
}

/// Brokers keyed by ID.
///
/// Every mutation takes the current time so liveness decisions can be tested
/// without waiting.
#[derive(Debug)]
pub struct BrokerRegistry {
    brokers: DashMap<String, BrokerNode>,
    timeout: Duration,
}

impl BrokerRegistry {
    /// `timeout` is how long a broker may go without a health check.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            brokers: DashMap::new(),
            timeout,
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Admit `id` with a session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateBrokerId`] if another caller holds a
    /// live session for `id`.
    pub fn authenticate(
        &self,
        id: &str,
        presented: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Admission, RegistryError> {
        match self.brokers.entry(id.to_string()) {
            Entry::Vacant(entry) => {
                let node = entry.insert(BrokerNode::new(id, now));
                Ok(Admission::New {
                    session: node.session.clone(),
                })
            }
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();

                if presented == Some(node.session.as_str()) {
                    node.last_health_check = now;
                    return Ok(Admission::Refreshed {
                        session: node.session.clone(),
                    });
                }

                if !node.is_overdue(self.timeout, now) {
                    return Err(RegistryError::DuplicateBrokerId(id.to_string()));
                }

                let previous = entry.insert(BrokerNode::new(id, now));
                Ok(Admission::Replaced {
                    session: entry.get().session.clone(),
                    previous,
                })
            }
        }
    }

    /// Record a health check, validating the session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotAuthenticated`] for an unknown broker or
    /// wrong session, and [`RegistryError::Expired`] (removing the node) if
    /// the broker's heartbeat was already overdue.
    pub fn touch(&self, id: &str, session: Option<&str>, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let Some(session) = session else {
            return Err(RegistryError::NotAuthenticated(id.to_string()));
        };

        let expired = {
            let mut node = self
                .brokers
                .get_mut(id)
                .filter(|node| node.session == session)
                .ok_or_else(|| RegistryError::NotAuthenticated(id.to_string()))?;

            if node.is_overdue(self.timeout, now) {
                true
            } else {
                node.last_health_check = now;
                false
            }
        };

        if expired {
            if let Some((_, node)) = self
                .brokers
                .remove_if(id, |_, node| node.session == session)
            {
                return Err(RegistryError::Expired(Box::new(node)));
            }
            return Err(RegistryError::NotAuthenticated(id.to_string()));
        }

        Ok(())
    }

    /// Note the messages handed to `id` by pull number `batch`.
    pub fn track(&self, id: &str, batch: u64, messages: Vec<MessageId>) {
        if let Some(mut node) = self.brokers.get_mut(id) {
            node.in_flight.extend(messages.iter().copied());
            node.last_pull = Some((batch, messages));
        }
    }

    /// The messages of pull `batch` if it is the last one answered for `id`.
    #[must_use]
    pub fn repeated_pull(&self, id: &str, batch: u64) -> Option<Vec<MessageId>> {
        self.brokers.get(id).and_then(|node| {
            node.last_pull
                .as_ref()
                .filter(|(last, _)| *last == batch)
                .map(|(_, messages)| messages.clone())
        })
    }

    /// Forget a confirmed message, whichever broker held it.
    pub fn untrack(&self, message: MessageId) {
        for mut node in self.brokers.iter_mut() {
            node.in_flight.remove(&message);
        }
    }

    /// Remove `id` if `session` is its current session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotAuthenticated`] otherwise.
    pub fn deauthenticate(&self, id: &str, session: Option<&str>) -> Result<BrokerNode, RegistryError> {
        session
            .and_then(|session| self.brokers.remove_if(id, |_, node| node.session == session))
            .map(|(_, node)| node)
            .ok_or_else(|| RegistryError::NotAuthenticated(id.to_string()))
    }

    /// Remove and return every broker whose heartbeat is overdue at `now`.
    pub fn reap_overdue(&self, now: DateTime<Utc>) -> Vec<BrokerNode> {
        let overdue: Vec<String> = self
            .brokers
            .iter()
            .filter(|node| node.is_overdue(self.timeout, now))
            .map(|node| node.id.clone())
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| {
                self.brokers
                    .remove_if(&id, |_, node| node.is_overdue(self.timeout, now))
                    .map(|(_, node)| node)
            })
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<BrokerNode> {
        self.brokers.get(id).map(|node| node.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_duplicate_id_is_rejected_while_live() {
        let registry = BrokerRegistry::new(TIMEOUT);
        let first = registry.authenticate("b1", None, t0()).unwrap();
        assert!(matches!(first, Admission::New { .. }));

        assert_eq!(
            registry.authenticate("b1", None, t0() + secs(5)),
            Err(RegistryError::DuplicateBrokerId("b1".to_string()))
        );
        assert_eq!(
            registry.authenticate("b1", Some("stolen"), t0() + secs(5)),
            Err(RegistryError::DuplicateBrokerId("b1".to_string()))
        );
    }

    #[test]
    fn test_reauthentication_refreshes_session() {
        let registry = BrokerRegistry::new(TIMEOUT);
        let session = registry.authenticate("b1", None, t0()).unwrap().session().to_string();

        let again = registry
            .authenticate("b1", Some(session.as_str()), t0() + secs(8))
            .unwrap();
        assert_eq!(
            again,
            Admission::Refreshed {
                session: session.clone()
            }
        );
        assert_eq!(registry.get("b1").unwrap().last_health_check, t0() + secs(8));
    }

    #[test]
    fn test_overdue_session_can_be_replaced() {
        let registry = BrokerRegistry::new(TIMEOUT);
        let session = registry.authenticate("b1", None, t0()).unwrap().session().to_string();
        let id = MessageId::generate();
        registry.track("b1", 1, vec![id]);

        let Admission::Replaced {
            session: replacement,
            previous,
        } = registry.authenticate("b1", None, t0() + secs(11)).unwrap()
        else {
            panic!("expected the overdue session to be replaced");
        };

        assert_ne!(replacement, session);
        assert_eq!(previous.in_flight, BTreeSet::from([id]));
        assert!(registry.get("b1").unwrap().in_flight.is_empty());
    }

    #[test]
    fn test_touch_validates_session() {
        let registry = BrokerRegistry::new(TIMEOUT);
        let session = registry.authenticate("b1", None, t0()).unwrap().session().to_string();

        registry.touch("b1", Some(session.as_str()), t0() + secs(9)).unwrap();
        registry.touch("b1", Some(session.as_str()), t0() + secs(18)).unwrap();

        assert_eq!(
            registry.touch("b1", Some("wrong"), t0() + secs(19)),
            Err(RegistryError::NotAuthenticated("b1".to_string()))
        );
        assert_eq!(
            registry.touch("b1", None, t0() + secs(19)),
            Err(RegistryError::NotAuthenticated("b1".to_string()))
        );
        assert_eq!(
            registry.touch("b2", Some(session.as_str()), t0() + secs(19)),
            Err(RegistryError::NotAuthenticated("b2".to_string()))
        );
    }

    #[test]
    fn test_touch_after_timeout_expires_node() {
        let registry = BrokerRegistry::new(TIMEOUT);
        let session = registry.authenticate("b1", None, t0()).unwrap().session().to_string();

        let Err(RegistryError::Expired(node)) = registry.touch("b1", Some(session.as_str()), t0() + secs(30))
        else {
            panic!("expected the session to have expired");
        };
        assert_eq!(node.id, "b1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reap_overdue() {
        let registry = BrokerRegistry::new(TIMEOUT);
        registry.authenticate("b1", None, t0()).unwrap();
        let live = registry
            .authenticate("b2", None, t0() + secs(5))
            .unwrap()
            .session()
            .to_string();
        registry.touch("b2", Some(live.as_str()), t0() + secs(9)).unwrap();

        let reaped = registry.reap_overdue(t0() + secs(12));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, "b1");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("b2").is_some());
    }

    #[test]
    fn test_deauthenticate_requires_session() {
        let registry = BrokerRegistry::new(TIMEOUT);
        let session = registry.authenticate("b1", None, t0()).unwrap().session().to_string();

        assert!(registry.deauthenticate("b1", Some("wrong")).is_err());
        let node = registry.deauthenticate("b1", Some(session.as_str())).unwrap();
        assert_eq!(node.id, "b1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_untrack() {
        let registry = BrokerRegistry::new(TIMEOUT);
        registry.authenticate("b1", None, t0()).unwrap();
        let (a, b) = (MessageId::generate(), MessageId::generate());
        registry.track("b1", 1, vec![a, b]);

        registry.untrack(a);
        assert_eq!(registry.get("b1").unwrap().in_flight, BTreeSet::from([b]));
    }

    #[test]
    fn test_repeated_pull() {
        let registry = BrokerRegistry::new(TIMEOUT);
        registry.authenticate("b1", None, t0()).unwrap();
        assert_eq!(registry.repeated_pull("b1", 1), None);

        let id = MessageId::generate();
        registry.track("b1", 1, vec![id]);
        assert_eq!(registry.repeated_pull("b1", 1), Some(vec![id]));
        assert_eq!(registry.repeated_pull("b1", 2), None);
        assert_eq!(registry.repeated_pull("b2", 1), None);

        registry.track("b1", 2, Vec::new());
        assert_eq!(registry.repeated_pull("b1", 1), None);
        assert_eq!(registry.repeated_pull("b1", 2), Some(Vec::new()));
    }
}
