//! Angler time syntax
//!
//! Durations are written as a whole number followed by a unit: `30s`, `5m`,
//! `12h`, `1d`, `2w`. Units are case-insensitive. A duration sequence is a
//! bracketed, comma separated list such as `[1m, 5m, 1h]`; a bare duration is
//! accepted as a sequence of one.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Errors produced while parsing Angler time syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    /// The value does not follow `<number><unit>`.
    #[error("Invalid duration syntax: {0:?}")]
    InvalidSyntax(String),

    /// The value is syntactically fine but does not fit in a duration.
    #[error("Duration out of range: {0:?}")]
    OutOfRange(String),

    /// A sequence contained no durations.
    #[error("Duration sequence is empty")]
    EmptySequence,
}

/// Parse a single duration such as `5m` or `30D`.
///
/// # Errors
///
/// Returns [`DurationParseError::InvalidSyntax`] when the value has no numeric
/// prefix, an unknown unit, or trailing characters.
pub fn parse_duration(value: &str) -> Result<Duration, DurationParseError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| DurationParseError::InvalidSyntax(value.to_string()))?;

    let (number, unit) = value.split_at(split);
    if number.is_empty() {
        return Err(DurationParseError::InvalidSyntax(value.to_string()));
    }

    let number: u64 = number
        .parse()
        .map_err(|_| DurationParseError::OutOfRange(value.to_string()))?;

    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "s" => 1,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        _ => return Err(DurationParseError::InvalidSyntax(value.to_string())),
    };

    number
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| DurationParseError::OutOfRange(value.to_string()))
}

/// Parse a duration sequence such as `[1m, 5m, 1d]`, or a bare duration.
///
/// # Errors
///
/// Returns an error if any element is malformed or the brackets are empty.
pub fn parse_duration_sequence(value: &str) -> Result<DurationSequence, DurationParseError> {
    let value = value.trim();

    let Some(inner) = value
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        if value.contains(',') || value.contains('[') || value.contains(']') {
            return Err(DurationParseError::InvalidSyntax(value.to_string()));
        }
        return DurationSequence::new(vec![parse_duration(value)?]);
    };

    if inner.trim().is_empty() {
        return Err(DurationParseError::EmptySequence);
    }

    inner
        .split(',')
        .map(parse_duration)
        .collect::<Result<Vec<_>, _>>()
        .and_then(DurationSequence::new)
}

/// Render a duration using the largest unit that divides it exactly.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }

    [(WEEK, "w"), (DAY, "d"), (HOUR, "h"), (MINUTE, "m")]
        .into_iter()
        .find(|(unit, _)| secs % unit == 0)
        .map_or_else(
            || format!("{secs}s"),
            |(unit, suffix)| format!("{}{suffix}", secs / unit),
        )
}

/// A non-empty, ordered list of intervals.
///
/// `[5m, 5m, 1h, 1d]` means: wait five minutes, then five minutes, then an
/// hour, then a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSequence {
    sequence: Vec<Duration>,
    total: Duration,
}

impl DurationSequence {
    /// Build a sequence from a list of durations.
    ///
    /// # Errors
    ///
    /// Returns [`DurationParseError::EmptySequence`] if `sequence` is empty.
    pub fn new(sequence: Vec<Duration>) -> Result<Self, DurationParseError> {
        if sequence.is_empty() {
            return Err(DurationParseError::EmptySequence);
        }

        let total = sequence.iter().sum();
        Ok(Self { sequence, total })
    }

    /// The element at `index`, or the last element when `index` runs past the end.
    #[must_use]
    pub fn get_or_last(&self, index: usize) -> Duration {
        self.sequence
            .get(index)
            .or_else(|| self.sequence.last())
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Duration] {
        &self.sequence
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Duration> {
        self.sequence
    }

    #[must_use]
    pub const fn total(&self) -> Duration {
        self.total
    }

    /// Sequences are never empty, so this is always at least one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Whether this sequence holds a single interval.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.sequence.len() == 1
    }
}

impl fmt::Display for DurationSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, duration) in self.sequence.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&format_duration(*duration))?;
        }
        f.write_str("]")
    }
}
