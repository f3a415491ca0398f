//! Retry policy resolution.
//!
//! A message may request its own policy. The server fills in whatever the
//! message leaves out from its configured defaults, and then forces the result
//! into its configured limits. What comes out is an [`EffectivePolicy`], which
//! is all the state machine needs to schedule retries.

use std::{fmt, time::Duration};

use angler_common::{
    config::RetryPolicyConfiguration,
    time::{DurationParseError, DurationSequence, format_duration, parse_duration_sequence},
};
use serde::{Deserialize, Serialize};

use super::DurationPolicy;
use crate::{error::PolicyError, types::RequestedPolicy};

/// A requested or default retry policy. Either part may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `Some(vec![])` is an explicit empty list, distinct from no interval.
    intervals: Option<Vec<Duration>>,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(intervals: Option<Vec<Duration>>, max_attempts: Option<u32>) -> Self {
        Self {
            intervals,
            max_attempts,
        }
    }

    /// Validate the raw fields of a requested policy.
    ///
    /// # Errors
    ///
    /// Rejects negative or oversized attempt counts and intervals that do not
    /// follow Angler time syntax. An empty list (`[]`) is accepted here; whether
    /// it is usable depends on the server defaults.
    pub fn parse(interval: Option<&str>, max_attempts: Option<i64>) -> Result<Self, PolicyError> {
        let max_attempts = max_attempts
            .map(|attempts| {
                if attempts < 0 {
                    return Err(PolicyError::NegativeMaxAttempts(attempts));
                }
                u32::try_from(attempts).map_err(|_| PolicyError::MaxAttemptsOutOfRange(attempts))
            })
            .transpose()?;

        let intervals = interval
            .map(|interval| match parse_duration_sequence(interval) {
                Ok(sequence) => Ok(sequence.into_vec()),
                Err(DurationParseError::EmptySequence) => Ok(Vec::new()),
                Err(e) => Err(e),
            })
            .transpose()?;

        Ok(Self {
            intervals,
            max_attempts,
        })
    }

    /// # Errors
    ///
    /// See [`RetryPolicy::parse`].
    pub fn from_requested(requested: &RequestedPolicy) -> Result<Self, PolicyError> {
        Self::parse(requested.interval.as_deref(), requested.max_attempts)
    }

    /// The server defaults from `retryPolicy.defaults.*`.
    #[must_use]
    pub fn defaults_from(config: &RetryPolicyConfiguration) -> Self {
        Self {
            intervals: config
                .default_interval
                .as_ref()
                .map(|sequence| sequence.as_slice().to_vec()),
            max_attempts: config.default_max_attempts.map(u32::from),
        }
    }

    #[must_use]
    pub fn intervals(&self) -> Option<&[Duration]> {
        self.intervals.as_deref()
    }

    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Hard bounds every effective policy must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    interval: DurationPolicy,
    max_attempts: u32,
}

impl RetryLimits {
    /// # Errors
    ///
    /// Returns [`PolicyError::ZeroAttemptLimit`] if `max_attempts` is zero.
    pub fn new(interval: DurationPolicy, max_attempts: u32) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttemptLimit);
        }

        Ok(Self {
            interval,
            max_attempts,
        })
    }

    /// The limits from `retryPolicy.limit.*`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interval bounds are inverted or the attempt
    /// limit is zero.
    pub fn from_config(config: &RetryPolicyConfiguration) -> Result<Self, PolicyError> {
        Self::new(
            DurationPolicy::new(config.min_interval, config.max_interval)?,
            u32::from(config.max_attempts),
        )
    }

    #[must_use]
    pub const fn interval(&self) -> DurationPolicy {
        self.interval
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// The policy actually applied to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectivePolicy {
    /// Any failure is terminal.
    NoRetry,
    /// The same interval between every attempt.
    Scalar { interval: Duration, max_attempts: u32 },
    /// One interval per retry, repeating the last once exhausted.
    Sequence {
        intervals: DurationSequence,
        max_attempts: u32,
    },
}

impl EffectivePolicy {
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        match self {
            Self::NoRetry => 1,
            Self::Scalar { max_attempts, .. } | Self::Sequence { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    #[must_use]
    pub const fn is_no_retry(&self) -> bool {
        matches!(self, Self::NoRetry)
    }

    /// Whether another attempt may follow `attempts` completed ones.
    #[must_use]
    pub const fn has_attempts_remaining(&self, attempts: u32) -> bool {
        !self.is_no_retry() && attempts < self.max_attempts()
    }

    /// Delay to wait after the failure of attempt `attempt` (zero based).
    ///
    /// `None` for [`EffectivePolicy::NoRetry`].
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::NoRetry => None,
            Self::Scalar { interval, .. } => Some(*interval),
            Self::Sequence { intervals, .. } => Some(
                intervals.get_or_last(usize::try_from(attempt).unwrap_or(usize::MAX)),
            ),
        }
    }
}

impl fmt::Display for EffectivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRetry => f.write_str("no-retry"),
            Self::Scalar {
                interval,
                max_attempts,
            } => write!(
                f,
                "every {} up to {max_attempts} attempts",
                format_duration(*interval)
            ),
            Self::Sequence {
                intervals,
                max_attempts,
            } => write!(f, "{intervals} up to {max_attempts} attempts"),
        }
    }
}

/// Merges requested policies with the server defaults under the server limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyEngine {
    defaults: RetryPolicy,
    limits: RetryLimits,
}

impl RetryPolicyEngine {
    #[must_use]
    pub const fn new(defaults: RetryPolicy, limits: RetryLimits) -> Self {
        Self { defaults, limits }
    }

    /// # Errors
    ///
    /// Returns an error if the configured limits are invalid.
    pub fn from_config(config: &RetryPolicyConfiguration) -> Result<Self, PolicyError> {
        Ok(Self::new(
            RetryPolicy::defaults_from(config),
            RetryLimits::from_config(config)?,
        ))
    }

    #[must_use]
    pub const fn defaults(&self) -> &RetryPolicy {
        &self.defaults
    }

    #[must_use]
    pub const fn limits(&self) -> &RetryLimits {
        &self.limits
    }

    /// Produce the effective policy for a message.
    ///
    /// With no interval requested and no default interval configured the
    /// result is [`EffectivePolicy::NoRetry`]. Interval lists are clamped
    /// element by element and truncated to the effective attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::EmptyInterval`] when the request carries an
    /// empty interval list together with a positive attempt count and the
    /// server has no default interval to fall back on.
    pub fn resolve(&self, requested: Option<&RetryPolicy>) -> Result<EffectivePolicy, PolicyError> {
        let requested_attempts = requested.and_then(RetryPolicy::max_attempts);
        let max_attempts = requested_attempts
            .or(self.defaults.max_attempts)
            .unwrap_or(self.limits.max_attempts)
            .clamp(1, self.limits.max_attempts);

        let defaults = self.defaults.intervals().filter(|list| !list.is_empty());
        let intervals = match requested.and_then(RetryPolicy::intervals) {
            Some(list) if !list.is_empty() => Some(list),
            Some(_) => match (defaults, requested_attempts) {
                (Some(list), _) => Some(list),
                (None, Some(attempts)) if attempts > 0 => {
                    return Err(PolicyError::EmptyInterval {
                        max_attempts: attempts,
                    });
                }
                (None, _) => None,
            },
            None => defaults,
        };

        let Some(intervals) = intervals else {
            return Ok(EffectivePolicy::NoRetry);
        };

        let bound = self.limits.interval;
        let clamped: Vec<Duration> = intervals
            .iter()
            .take(usize::try_from(max_attempts).unwrap_or(usize::MAX))
            .map(|interval| bound.clamp(*interval))
            .collect();

        if let [interval] = clamped.as_slice() {
            return Ok(EffectivePolicy::Scalar {
                interval: *interval,
                max_attempts,
            });
        }

        Ok(EffectivePolicy::Sequence {
            intervals: DurationSequence::new(clamped)?,
            max_attempts,
        })
    }
}
