use std::time::Duration;

use crate::error::PolicyError;

/// An inclusive `[min, max]` bound on retry intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationPolicy {
    min: Duration,
    max: Duration,
}

impl DurationPolicy {
    /// # Errors
    ///
    /// Returns [`PolicyError::InvertedLimits`] if `min` exceeds `max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, PolicyError> {
        if min > max {
            return Err(PolicyError::InvertedLimits { min, max });
        }

        Ok(Self { min, max })
    }

    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Bring `duration` into range.
    #[must_use]
    pub fn clamp(&self, duration: Duration) -> Duration {
        duration.clamp(self.min, self.max)
    }

    #[must_use]
    pub fn contains(&self, duration: Duration) -> bool {
        (self.min..=self.max).contains(&duration)
    }
}
