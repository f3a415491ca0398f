//! Error types for the angler-common crate.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::time::DurationParseError;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A key holds a value of the wrong shape.
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    /// A duration-valued key did not follow Angler time syntax.
    #[error("Invalid duration for {key}: {source}")]
    Duration {
        key: &'static str,
        #[source]
        source: DurationParseError,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}
