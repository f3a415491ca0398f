//! HTTP delivery to recipients

use std::{str::FromStr, time::Duration};

use angler_common::outgoing;
use async_trait::async_trait;
use reqwest::{
    Method,
    header::{HeaderMap, HeaderName, HeaderValue},
};

use crate::{error::DeliveryError, types::Message};

/// Performs one delivery attempt for a message.
///
/// Implementations only report what happened; timeouts and fault isolation
/// are handled by the worker pool.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] describing why the recipient did not accept
    /// the message.
    async fn deliver(&self, message: &Message, attempt: u32) -> Result<(), DeliveryError>;
}

const USER_AGENT: &str = concat!("Angler/", env!("CARGO_PKG_VERSION"));

/// Delivers [`crate::DeliveryType::Http`] messages with a shared connection pool.
///
/// A 2xx response is a success. Anything else, including redirects that
/// could not be followed, is a failure.
#[derive(Debug, Clone)]
pub struct HttpDeliverer {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDeliverer {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| DeliveryError::Failure(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, timeout })
    }

    fn headers(message: &Message, attempt: u32) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();

        for (name, value) in &message.payload.headers {
            let name = HeaderName::from_str(name)
                .map_err(|e| DeliveryError::Failure(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DeliveryError::Failure(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        for (name, value) in [
            ("x-angler-message-id", message.id.to_string()),
            ("x-angler-event-id", message.event_id.clone()),
            ("x-angler-attempt", attempt.to_string()),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        Ok(headers)
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, message: &Message, attempt: u32) -> Result<(), DeliveryError> {
        let payload = &message.payload;
        let method = Method::from_bytes(payload.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| DeliveryError::Failure(format!("invalid method {:?}: {e}", payload.method)))?;

        outgoing!(
            level = DEBUG,
            message_id = %message.id,
            attempt,
            method = %method,
            url = %payload.url,
            "Delivering"
        );

        let response = self
            .client
            .request(method, &payload.url)
            .headers(Self::headers(message, attempt)?)
            .body(payload.body.clone())
            .send()
            .await
            .map_err(|e| match DeliveryError::from(e) {
                DeliveryError::Timeout(_) => DeliveryError::Timeout(self.timeout),
                other => other,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(DeliveryError::Failure(format!("recipient responded with {status}")))
    }
}
