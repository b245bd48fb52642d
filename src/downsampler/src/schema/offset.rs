//! Relative age offsets (`7d`, `4w`) and the reference time they resolve against.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::SchemaError;

/// Timestamp layout used in generated time predicates.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Unit suffix of an offset. Years are fixed 365-day years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Years,
}

impl OffsetUnit {
    pub fn from_suffix(suffix: char) -> Option<Self> {
        match suffix {
            's' => Some(OffsetUnit::Seconds),
            'm' => Some(OffsetUnit::Minutes),
            'h' => Some(OffsetUnit::Hours),
            'd' => Some(OffsetUnit::Days),
            'w' => Some(OffsetUnit::Weeks),
            'y' => Some(OffsetUnit::Years),
            _ => None,
        }
    }

    pub fn suffix(&self) -> char {
        match self {
            OffsetUnit::Seconds => 's',
            OffsetUnit::Minutes => 'm',
            OffsetUnit::Hours => 'h',
            OffsetUnit::Days => 'd',
            OffsetUnit::Weeks => 'w',
            OffsetUnit::Years => 'y',
        }
    }

    /// Length of one unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            OffsetUnit::Seconds => 1,
            OffsetUnit::Minutes => 60,
            OffsetUnit::Hours => 3_600,
            OffsetUnit::Days => 86_400,
            OffsetUnit::Weeks => 604_800,
            OffsetUnit::Years => 31_536_000,
        }
    }
}

/// An integer amount of a unit, e.g. `90d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Offset {
    pub amount: u64,
    pub unit: OffsetUnit,
}

impl Offset {
    pub fn as_secs(&self) -> Option<u64> {
        self.amount.checked_mul(self.unit.seconds())
    }

    pub fn as_duration(&self) -> Option<Duration> {
        self.as_secs().map(Duration::from_secs)
    }
}

impl FromStr for Offset {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some(suffix) = s.chars().last() else {
            return Err(SchemaError::InvalidOffset {
                offset: s.to_string(),
            });
        };
        let digits = &s[..s.len() - suffix.len_utf8()];

        // `u64::from_str` alone would also accept a leading `+`
        let amount = digits
            .bytes()
            .all(|b| b.is_ascii_digit())
            .then(|| digits.parse::<u64>().ok())
            .flatten()
            .ok_or_else(|| SchemaError::InvalidOffset {
                offset: s.to_string(),
            })?;
        let unit = OffsetUnit::from_suffix(suffix).ok_or_else(|| SchemaError::InvalidOffsetUnit {
            offset: s.to_string(),
            unit: suffix,
        })?;

        Ok(Offset { amount, unit })
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

/// The single instant every relative age of one compilation resolves against.
///
/// Captured once, with second precision, and never re-read from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReferenceTime(DateTime<Utc>);

impl ReferenceTime {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant.trunc_subsecs(0))
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    /// The absolute timestamp `offset` before the reference time.
    pub fn resolve(&self, offset: &Offset) -> Result<DateTime<Utc>, SchemaError> {
        offset
            .as_secs()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
            .and_then(|delta| self.0.checked_sub_signed(delta))
            .ok_or_else(|| SchemaError::TimestampOutOfRange {
                offset: offset.to_string(),
            })
    }
}

impl fmt::Display for ReferenceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_timestamp(&self.0))
    }
}

/// ISO-8601 UTC with second precision, e.g. `2024-01-09T00:00:00Z`.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Resolve a textual offset against the reference time and format it.
pub fn convert_offset(reference: &ReferenceTime, offset: &str) -> Result<String, SchemaError> {
    let offset = offset.parse::<Offset>()?;
    Ok(format_timestamp(&reference.resolve(&offset)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference() -> ReferenceTime {
        ReferenceTime::at(Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_convert_offset_one_day() {
        let reference = reference();
        let expected = reference.instant() - TimeDelta::seconds(86_400);

        assert_eq!(
            convert_offset(&reference, "1d").unwrap(),
            format_timestamp(&expected)
        );
        assert_eq!(
            convert_offset(&reference, "1d").unwrap(),
            "2024-01-09T12:00:00Z"
        );
    }

    #[test]
    fn test_convert_offset_two_weeks() {
        let reference = reference();
        let expected = reference.instant() - TimeDelta::seconds(1_209_600);

        assert_eq!(
            convert_offset(&reference, "2w").unwrap(),
            format_timestamp(&expected)
        );
    }

    #[test]
    fn test_unit_multipliers() {
        let cases = [
            ("30s", 30),
            ("5m", 300),
            ("2h", 7_200),
            ("3d", 259_200),
            ("1w", 604_800),
            ("1y", 31_536_000),
        ];
        for (text, secs) in cases {
            let offset: Offset = text.parse().unwrap();
            assert_eq!(offset.as_secs(), Some(secs), "{text}");
            assert_eq!(offset.to_string(), text);
        }
    }

    #[test]
    fn test_years_ignore_leap_days() {
        // The span crosses 2024-02-29, so a 365-day year lands one calendar day late
        let reference = ReferenceTime::at(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap());
        assert_eq!(
            convert_offset(&reference, "1y").unwrap(),
            "2023-03-11T12:00:00Z"
        );
    }

    #[test]
    fn test_invalid_unit() {
        let err = convert_offset(&reference(), "5x").unwrap_err();
        assert!(matches!(
            err,
            SchemaError::InvalidOffsetUnit { unit: 'x', .. }
        ));
    }

    #[test]
    fn test_invalid_amount() {
        for text in ["", "d", "-1d", "+5d", "1.5h", "ten_d", "1 d"] {
            let err = text.parse::<Offset>().unwrap_err();
            assert!(
                matches!(err, SchemaError::InvalidOffset { .. }),
                "{text}: {err:?}"
            );
        }
    }

    #[test]
    fn test_reference_time_truncates_subseconds() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
            + TimeDelta::milliseconds(750);
        let reference = ReferenceTime::at(instant);
        assert_eq!(reference.to_string(), "2024-01-10T12:00:00Z");
        assert_eq!(reference.instant().timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let offset = Offset {
            amount: u64::MAX,
            unit: OffsetUnit::Years,
        };
        assert!(matches!(
            reference().resolve(&offset),
            Err(SchemaError::TimestampOutOfRange { .. })
        ));
    }
}
