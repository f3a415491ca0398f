//! The Angler process: a delivery engine running standalone, as a cluster
//! controller, or as a broker.

pub mod runtime;

pub use runtime::{Angler, Role, SHUTDOWN_BROADCAST};
