use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use angler_cluster::{Broker, ClusterCoordinator, ClusterError, ClusterServer};
use angler_common::{Signal, config::Configuration, internal, logging};
use angler_delivery::{Deliverer, DeliveryProcessor, HttpDeliverer};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// How long running work may take to wind down after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What this process does in the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    /// A single node delivering everything itself
    #[default]
    Standalone,
    /// The authoritative node handing work to brokers
    Controller,
    /// A worker node delivering for a controller
    Broker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Standalone => "standalone",
            Self::Controller => "controller",
            Self::Broker => "broker",
        })
    }
}

#[derive(Debug)]
enum Node {
    Standalone(Arc<DeliveryProcessor>),
    Controller(Arc<ClusterCoordinator>),
    Broker(Arc<Broker>),
}

/// One Angler process
#[derive(Debug)]
pub struct Angler {
    config: Arc<Configuration>,
    node: Node,
}

impl Angler {
    /// Build a node delivering over HTTP.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built, or see [`Angler::with_deliverer`].
    pub fn new(config: Configuration, role: Role, broker_id: Option<String>) -> anyhow::Result<Self> {
        let deliverer = HttpDeliverer::new(config.messages_processor.message_delivery_timeout)?;
        Self::with_deliverer(Arc::new(config), role, broker_id, Arc::new(deliverer))
    }

    /// # Errors
    ///
    /// Fails if the retry policy configuration is invalid, or if a cluster
    /// role is requested without `cluster.authKey`.
    pub fn with_deliverer(
        config: Arc<Configuration>,
        role: Role,
        broker_id: Option<String>,
        deliverer: Arc<dyn Deliverer>,
    ) -> anyhow::Result<Self> {
        let node = match role {
            Role::Standalone => Node::Standalone(Arc::new(DeliveryProcessor::new(
                Arc::clone(&config),
                deliverer,
                None,
            )?)),
            Role::Controller => {
                if config.cluster.auth_key.is_none() {
                    return Err(ClusterError::AuthKeyMissing.into());
                }
                let processor =
                    Arc::new(DeliveryProcessor::new(Arc::clone(&config), deliverer, None)?);
                Node::Controller(Arc::new(ClusterCoordinator::new(processor, &config.cluster)))
            }
            Role::Broker => {
                let id = broker_id.unwrap_or_else(|| format!("broker-{}", ulid::Ulid::new()));
                Node::Broker(Arc::new(Broker::new(id, Arc::clone(&config), deliverer)?))
            }
        };

        Ok(Self { config, node })
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        match self.node {
            Node::Standalone(_) => Role::Standalone,
            Node::Controller(_) => Role::Controller,
            Node::Broker(_) => Role::Broker,
        }
    }

    /// The engine messages are submitted to on this node.
    #[must_use]
    pub fn processor(&self) -> &Arc<DeliveryProcessor> {
        match &self.node {
            Node::Standalone(processor) => processor,
            Node::Controller(coordinator) => coordinator.processor(),
            Node::Broker(broker) => broker.processor(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Run this node until `shutdown` delivers a signal and its work drains.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller cannot bind its listener.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> anyhow::Result<()> {
        internal!(level = INFO, role = %self.role(), "Node starting");

        match &self.node {
            Node::Standalone(processor) => processor.serve(shutdown).await,
            Node::Controller(coordinator) => {
                let server = ClusterServer::bind(
                    &self.config.cluster.controller_host,
                    Arc::clone(coordinator) as _,
                )
                .await?;

                let local = async {
                    if self.config.cluster.local_delivery {
                        info!("Controller delivering locally as well");
                        coordinator.processor().serve(shutdown.resubscribe()).await;
                    }
                };

                let (served, (), ()) = tokio::join!(
                    server.serve(shutdown.resubscribe()),
                    coordinator.sweep(shutdown.resubscribe()),
                    local
                );
                served?;
            }
            Node::Broker(broker) => Arc::clone(broker).run(shutdown).await,
        }

        internal!(level = INFO, role = %self.role(), "Node stopped");
        Ok(())
    }

    /// Run until SIGINT or SIGTERM, then drain and exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails or signal handlers cannot be
    /// installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.config.logging);

        let node = self.serve(SHUTDOWN_BROADCAST.subscribe());
        tokio::pin!(node);

        tokio::select! {
            result = &mut node => return result,
            result = shutdown() => result?,
        }

        match tokio::time::timeout(DRAIN_TIMEOUT, node).await {
            Ok(result) => result?,
            Err(_) => warn!("Work did not drain within {DRAIN_TIMEOUT:?}, exiting anyway"),
        }

        if SHUTDOWN_BROADCAST.send(Signal::Finalised).is_err() {
            debug!("No tasks left to receive the final signal");
        }
        internal!("Shutdown complete");

        Ok(())
    }
}

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}
