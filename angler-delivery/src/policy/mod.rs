//! Retry policy evaluation and bound enforcement

mod duration;
mod retry;

pub use duration::DurationPolicy;
pub use retry::{EffectivePolicy, RetryLimits, RetryPolicy, RetryPolicyEngine};
