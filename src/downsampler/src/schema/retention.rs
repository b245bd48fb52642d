//! Retention tiers and the time windows they compile into.
//!
//! A retention spec such as `"1m:1d,1h:4w,*:*"` lists tiers from the most
//! recent to the oldest. Each tier keeps data younger than the previous
//! tier's age threshold and at least as old as its own. Compiled against one
//! [`ReferenceTime`], the tiers become contiguous windows:
//!
//! ```text
//!   -inf ........ T-4w ........ T-1d ........ now
//!   |  *:*        |  1h:4w      |  1m:1d      |
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::error::SchemaError;
use super::offset::{Offset, ReferenceTime};

const UNBOUNDED: &str = "*";

/// One `interval:min_age` entry of a retention spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionTier {
    /// Bucket width, `None` keeps raw points.
    pub interval: Option<Offset>,
    /// Age threshold, `None` reaches into the unbounded past.
    pub min_age: Option<Offset>,
}

/// The absolute time range one tier covers, plus its bucket width.
///
/// The lower bound is inclusive and the upper bound exclusive, matching the
/// generated `time >= min AND time < max` predicate, so an instant on the
/// edge between two tiers belongs to the more recent one only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub interval: Option<Duration>,
    pub min_timestamp: Option<DateTime<Utc>>,
    pub max_timestamp: Option<DateTime<Utc>>,
}

impl RetentionWindow {
    pub fn is_bucketed(&self) -> bool {
        self.interval.is_some()
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.min_timestamp.is_none_or(|min| timestamp >= min)
            && self.max_timestamp.is_none_or(|max| timestamp < max)
    }
}

/// Parse a retention spec into ordered tiers.
///
/// Ages must grow strictly from one tier to the next and an unbounded age is
/// only allowed on the last tier, otherwise the windows would overlap.
pub fn parse_retentions(spec: &str) -> Result<Vec<RetentionTier>, SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidRetention {
        spec: spec.to_string(),
        reason,
    };

    let mut tiers: Vec<RetentionTier> = Vec::new();
    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(invalid("empty tier".to_string()));
        }

        let (interval, min_age) = token
            .split_once(':')
            .ok_or_else(|| invalid(format!("tier '{token}' is not interval:min_age")))?;

        let interval = parse_optional(interval)?;
        if let Some(offset) = interval
            && offset.amount == 0
        {
            return Err(SchemaError::InvalidInterval {
                interval: offset.to_string(),
            });
        }
        let min_age = parse_optional(min_age)?;

        if let Some(previous) = tiers.last() {
            check_ordering(spec, previous, min_age)?;
        }

        tiers.push(RetentionTier { interval, min_age });
    }

    Ok(tiers)
}

fn parse_optional(text: &str) -> Result<Option<Offset>, SchemaError> {
    let text = text.trim();
    if text == UNBOUNDED {
        Ok(None)
    } else {
        text.parse().map(Some)
    }
}

fn check_ordering(
    spec: &str,
    previous: &RetentionTier,
    min_age: Option<Offset>,
) -> Result<(), SchemaError> {
    let Some(previous_age) = previous.min_age else {
        return Err(SchemaError::NonMonotonicRetention {
            spec: spec.to_string(),
            reason: "only the last tier may have an unbounded age".to_string(),
        });
    };
    let Some(age) = min_age else {
        return Ok(());
    };

    let as_secs = |offset: Offset| {
        offset
            .as_secs()
            .ok_or_else(|| SchemaError::TimestampOutOfRange {
                offset: offset.to_string(),
            })
    };
    if as_secs(age)? <= as_secs(previous_age)? {
        return Err(SchemaError::NonMonotonicRetention {
            spec: spec.to_string(),
            reason: format!("age {age} must be older than {previous_age}"),
        });
    }
    Ok(())
}

/// Turn ordered tiers into chained windows anchored at `reference`.
///
/// Window `i` ends where window `i - 1` begins; the first window has no upper
/// bound and a tier with an unbounded age has no lower bound.
pub fn build_windows(
    reference: &ReferenceTime,
    tiers: &[RetentionTier],
) -> Result<Vec<RetentionWindow>, SchemaError> {
    let mut windows: Vec<RetentionWindow> = Vec::with_capacity(tiers.len());

    for tier in tiers {
        let max_timestamp = windows.last().and_then(|previous| previous.min_timestamp);
        let min_timestamp = tier
            .min_age
            .map(|age| reference.resolve(&age))
            .transpose()?;
        let interval = tier
            .interval
            .map(|offset| {
                offset
                    .as_duration()
                    .ok_or_else(|| SchemaError::TimestampOutOfRange {
                        offset: offset.to_string(),
                    })
            })
            .transpose()?;

        windows.push(RetentionWindow {
            interval,
            min_timestamp,
            max_timestamp,
        });
    }

    Ok(windows)
}
