//! Client ingestion transports
//!
//! Each enabled protocol turns a raw client request into a [`Submission`]. The
//! engine only ever sees submissions, never the wire format.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::TransportError,
    types::{DeliveryType, Payload, RequestedPolicy, Submission},
};

pub trait ClientTransport: Send + Sync {
    /// Name used in `net.client.protocols`
    fn protocol(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns [`TransportError::Malformed`] if `raw` is not a valid request.
    fn decode(&self, raw: &[u8]) -> Result<Submission, TransportError>;
}

/// The transports enabled for this node, keyed by protocol name
#[derive(Clone, Default)]
pub struct TransportSet {
    transports: BTreeMap<&'static str, Arc<dyn ClientTransport>>,
}

impl fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.transports.keys()).finish()
    }
}

impl TransportSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the set named by the configuration.
    ///
    /// Protocols without an implementation here (such as `restful`, which is
    /// served by an external gateway) are skipped with a warning.
    #[must_use]
    pub fn from_protocols(protocols: &BTreeSet<String>) -> Self {
        let mut set = Self::new();

        for protocol in protocols {
            match protocol.as_str() {
                JsonTransport::PROTOCOL => set.register(Arc::new(JsonTransport)),
                other => warn!(protocol = other, "No ingestion transport for protocol, skipping"),
            }
        }

        set
    }

    pub fn register(&mut self, transport: Arc<dyn ClientTransport>) {
        self.transports.insert(transport.protocol(), transport);
    }

    #[must_use]
    pub fn get(&self, protocol: &str) -> Option<&Arc<dyn ClientTransport>> {
        self.transports.get(protocol)
    }

    /// # Errors
    ///
    /// Fails if `protocol` is not enabled or the request cannot be decoded.
    pub fn decode(&self, protocol: &str, raw: &[u8]) -> Result<Submission, TransportError> {
        self.get(protocol)
            .ok_or_else(|| TransportError::UnknownProtocol(protocol.to_string()))?
            .decode(raw)
    }

    pub fn protocols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.transports.keys().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

/// Submissions as JSON documents:
///
/// ```json
/// {
///   "recipientId": "r-1",
///   "serviceId": "billing",
///   "eventId": "invoice.paid",
///   "payload": { "url": "https://example.com/hook", "body": "{}" },
///   "retryPolicy": { "interval": "[1m, 5m]", "maxAttempts": 3 }
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTransport;

impl JsonTransport {
    pub const PROTOCOL: &'static str = "json";
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonSubmission {
    recipient_id: String,
    service_id: String,
    event_id: String,
    #[serde(default)]
    delivery_type: DeliveryType,
    payload: JsonPayload,
    #[serde(default)]
    retry_policy: Option<JsonRetryPolicy>,
}

#[derive(Debug, Deserialize)]
struct JsonPayload {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonRetryPolicy {
    #[serde(default)]
    interval: Option<JsonInterval>,
    #[serde(default)]
    max_attempts: Option<i64>,
}

/// `"5m"`, `"[1m, 5m]"` or `["1m", "5m"]`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonInterval {
    Text(String),
    List(Vec<String>),
}

impl From<JsonInterval> for String {
    fn from(interval: JsonInterval) -> Self {
        match interval {
            JsonInterval::Text(text) => text,
            JsonInterval::List(items) => format!("[{}]", items.join(", ")),
        }
    }
}

fn malformed(reason: impl Into<String>) -> TransportError {
    TransportError::Malformed {
        protocol: JsonTransport::PROTOCOL,
        reason: reason.into(),
    }
}

impl ClientTransport for JsonTransport {
    fn protocol(&self) -> &'static str {
        Self::PROTOCOL
    }

    fn decode(&self, raw: &[u8]) -> Result<Submission, TransportError> {
        let request: JsonSubmission =
            serde_json::from_slice(raw).map_err(|e| malformed(e.to_string()))?;

        if request.recipient_id.trim().is_empty() {
            return Err(malformed("recipientId must not be empty"));
        }

        if request.payload.url.trim().is_empty() {
            return Err(malformed("payload.url must not be empty"));
        }

        let mut payload = Payload::post(request.payload.url, request.payload.body);
        payload.headers = request.payload.headers;
        if let Some(method) = request.payload.method {
            payload = payload.with_method(method);
        }

        Ok(Submission {
            recipient_id: request.recipient_id,
            service_id: request.service_id,
            event_id: request.event_id,
            delivery_type: request.delivery_type,
            payload,
            retry_policy: request.retry_policy.map(|policy| RequestedPolicy {
                interval: policy.interval.map(String::from),
                max_attempts: policy.max_attempts,
            }),
        })
    }
}
