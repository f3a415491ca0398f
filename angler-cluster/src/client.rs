//! Broker side client for the controller

use std::time::Duration;

use tokio::{net::TcpStream, sync::Mutex};
use tracing::{debug, trace, warn};

use crate::{
    ClusterError, PROTOCOL_VERSION, Result,
    codec::{MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, read_frame, write_frame},
    protocol::{Request, Response},
};

/// Keeps one connection to the controller open, reconnecting once when a
/// request fails on a stale connection.
///
/// Requests are answered strictly in order on a connection, so only one
/// exchange is in flight at a time.
#[derive(Debug)]
pub struct ClusterClient {
    addr: String,
    timeout: Duration,
    connection: Mutex<Option<TcpStream>>,
}

impl ClusterClient {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
            connection: Mutex::new(None),
        }
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream> {
        debug!("Connecting to controller at {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send a request and wait for its response.
    ///
    /// A response with `success = false` is returned as is; use
    /// [`ClusterClient::call`] to turn it into an error.
    ///
    /// The connection is dropped whenever an exchange fails or times out, so
    /// a late reply can never be read as the answer to a later request.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller cannot be reached, the exchange
    /// times out, or the controller speaks another protocol version.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let mut connection = self.connection.lock().await;

        let result =
            tokio::time::timeout(self.timeout, self.exchange_on(&mut connection, &request)).await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                *connection = None;
                Err(e)
            }
            Err(_) => {
                warn!(
                    command = request.command.name(),
                    "Controller did not answer within {:?}, dropping connection",
                    self.timeout
                );
                *connection = None;
                Err(ClusterError::Timeout)
            }
        }
    }

    /// Like [`ClusterClient::send`], failing on a rejected request.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Rejected`] when the controller answers with
    /// `success = false`.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let response = self.send(request).await?;
        if response.success {
            return Ok(response);
        }

        let message = match &response.payload {
            crate::ResponsePayload::Error(message) => message.clone(),
            _ => String::new(),
        };
        Err(ClusterError::Rejected {
            code: response.code,
            message,
        })
    }

    /// Exchange on the open connection, reconnecting once if it has gone
    /// stale. Confirmations are idempotent and pulls carry a batch number,
    /// so a request the controller already applied may be sent again.
    async fn exchange_on(
        &self,
        connection: &mut Option<TcpStream>,
        request: &Request,
    ) -> Result<Response> {
        if let Some(stream) = connection.as_mut() {
            match Self::exchange(stream, request).await {
                Ok(response) => return Ok(response),
                Err(e @ ClusterError::IncompatibleVersion { .. }) => return Err(e),
                Err(e) => {
                    warn!("Controller connection failed ({e}), reconnecting to {}", self.addr);
                    *connection = None;
                }
            }
        }

        let mut stream = self.connect().await?;
        let response = Self::exchange(&mut stream, request).await?;
        *connection = Some(stream);
        Ok(response)
    }

    async fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response> {
        trace!(command = request.command.name(), "Sending cluster request");
        write_frame(stream, request, MAX_REQUEST_SIZE).await?;

        let response: Response = read_frame(stream, MAX_RESPONSE_SIZE).await?;
        if !response.is_version_compatible() {
            return Err(ClusterError::IncompatibleVersion {
                remote: response.version,
                local: PROTOCOL_VERSION,
            });
        }

        Ok(response)
    }

    /// Drop the current connection, if any.
    pub async fn disconnect(&self) {
        self.connection.lock().await.take();
    }
}
