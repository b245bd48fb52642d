use common::config::ConfigError;
use thiserror::Error;

/// Errors raised while loading or compiling a downsampling schema.
///
/// Every variant except [`SchemaError::InvalidOffsetUnit`] describes a
/// malformed schema; all of them abort before the datastore is touched.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A pattern is not a valid regular expression.
    #[error("Invalid {target} pattern '{pattern}' in policy #{policy}: {source}")]
    InvalidPattern {
        policy: usize,
        target: &'static str,
        pattern: String,
        source: regex::Error,
    },

    /// A retention spec is not a comma separated list of `interval:min_age`.
    #[error("Invalid retention '{spec}': {reason}")]
    InvalidRetention { spec: String, reason: String },

    /// Offset amount is missing or not a non-negative integer.
    #[error("Invalid offset '{offset}': expected an integer followed by a unit")]
    InvalidOffset { offset: String },

    /// Offset suffix is not one of `s, m, h, d, w, y`.
    #[error("Invalid offset unit '{unit}' in '{offset}': expected one of s, m, h, d, w, y")]
    InvalidOffsetUnit { offset: String, unit: char },

    /// A bucket interval of zero length.
    #[error("Invalid bucket interval '{interval}': must be greater than zero")]
    InvalidInterval { interval: String },

    /// Tier ages must grow strictly, and only the last tier may be unbounded.
    #[error("Invalid retention '{spec}': {reason}")]
    NonMonotonicRetention { spec: String, reason: String },

    /// Aggregation template without a `{}` placeholder for the field key.
    #[error("Invalid aggregation function '{template}': missing '{{}}' placeholder")]
    InvalidFunction { template: String },

    /// Resolving an offset against the reference time overflowed.
    #[error("Offset '{offset}' reaches outside the representable time range")]
    TimestampOutOfRange { offset: String },
}

impl SchemaError {
    /// True for every malformed-schema error, false for a bad offset unit.
    pub fn is_parse_error(&self) -> bool {
        !matches!(self, SchemaError::InvalidOffsetUnit { .. })
    }
}
