//! Controller side TCP server

use std::{net::SocketAddr, sync::Arc};

use angler_common::{Signal, incoming, outgoing};
use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tracing::{debug, error, info, warn};

use crate::{
    ClusterError, Result,
    codec::{MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, read_frame, write_frame},
    protocol::{Request, Response, ResponseCode},
};

/// Processes cluster requests.
///
/// Every outcome, including rejection, is expressed as a [`Response`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> Response;
}

/// Accepts broker connections and answers their requests in order.
pub struct ClusterServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
}

impl ClusterServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &str, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    /// # Errors
    ///
    /// Returns an error if the bound address cannot be read back.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        info!("Cluster server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&self.handler);
                            let shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                match Self::handle_connection(stream, peer, handler, shutdown).await {
                                    Ok(()) | Err(ClusterError::ConnectionClosed) => {
                                        debug!(%peer, "Broker connection closed");
                                    }
                                    Err(e) => warn!(%peer, "Broker connection ended: {e}"),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting broker connection: {e}");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!("Cluster server shutting down");
                            break;
                        }
                        Err(e) => {
                            error!("Cluster server shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        loop {
            let request = tokio::select! {
                request = read_frame::<Request, _>(&mut stream, MAX_REQUEST_SIZE) => request,
                _ = shutdown.recv() => return Ok(()),
            };

            let request = match request {
                Ok(request) => request,
                Err(
                    e @ (ClusterError::FrameTooLarge { .. }
                    | ClusterError::ProtocolDeserialization(_)),
                ) => {
                    warn!(%peer, "Malformed cluster request: {e}");
                    let response = Response::error(ResponseCode::MalformedRequest, e.to_string());
                    write_frame(&mut stream, &response, MAX_RESPONSE_SIZE).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            incoming!(
                broker_id = %request.broker_id,
                command = request.command.name(),
                "Cluster request"
            );

            let response = if request.is_version_compatible() {
                handler.handle_request(request).await
            } else {
                Response::error(
                    ResponseCode::IncompatibleVersion,
                    format!(
                        "Incompatible protocol version: broker={}, controller={}",
                        request.version,
                        crate::PROTOCOL_VERSION
                    ),
                )
            };

            outgoing!(
                success = response.success,
                code = response.code,
                "Cluster response"
            );

            write_frame(&mut stream, &response, MAX_RESPONSE_SIZE).await?;
        }
    }
}
