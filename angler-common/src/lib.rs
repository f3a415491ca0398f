pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use tracing;

/// Lifecycle signal broadcast to every long-running task of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop taking new work and wind down.
    Shutdown,
    /// Every task has drained; the process may exit.
    Finalised,
}
