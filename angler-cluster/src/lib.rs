//! Controller and broker coordination.
//!
//! A controller owns every message and hands due ones to authenticated
//! brokers over a small request/response protocol. Brokers deliver them with
//! their own engine and report terminal outcomes back.

pub mod auth;
pub mod broker;
pub mod client;
pub mod codec;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

pub use auth::ClusterKey;
pub use broker::{Backoff, Broker, Outbox};
pub use client::ClusterClient;
pub use controller::ClusterCoordinator;
pub use error::{ClusterError, Result};
pub use protocol::{Command, PROTOCOL_VERSION, Request, Response, ResponseCode, ResponsePayload};
pub use registry::{Admission, BrokerNode, BrokerRegistry, BrokerState, RegistryError};
pub use server::{ClusterServer, RequestHandler};
