//! The time-series datastore as seen by the downsampler.
//!
//! Three capabilities are needed: list measurements, describe a
//! measurement's fields, and execute a statement. Timeouts are reported as
//! [`DatastoreError::Timeout`] so callers can retry them.

pub mod influx;
pub mod memory;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::planner::Statement;

pub use influx::InfluxClient;
pub use memory::InMemoryDatastore;

/// Field type as reported by `SHOW FIELD KEYS`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Float,
    Integer,
    Unsigned,
    String,
    Boolean,
    Other(String),
}

impl FieldType {
    pub fn parse(name: &str) -> Self {
        match name {
            "float" => FieldType::Float,
            "integer" => FieldType::Integer,
            "unsigned" => FieldType::Unsigned,
            "string" => FieldType::String,
            "boolean" => FieldType::Boolean,
            other => FieldType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Unsigned => "unsigned",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Other(name) => name,
        }
    }

    /// Only float and integer fields are ever aggregated.
    pub fn is_downsampled(&self) -> bool {
        matches!(self, FieldType::Float | FieldType::Integer)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field key and its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub key: String,
    pub field_type: FieldType,
}

impl FieldInfo {
    pub fn new(key: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            field_type,
        }
    }
}

/// Result of executing a statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Points written by an `INTO` statement, zero otherwise.
    pub written: u64,
}

#[derive(Error, Debug)]
pub enum DatastoreError {
    /// The server is busy or timed out; the identical statement may be resubmitted.
    #[error("Datastore timeout: {0}")]
    Timeout(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unexpected HTTP status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DatastoreError {
    /// Whether a retry of the same statement can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DatastoreError::Timeout(_) => true,
            DatastoreError::Http { status, .. } => matches!(status, 408 | 503 | 504),
            DatastoreError::Transport(e) => e.is_timeout(),
            DatastoreError::Query(_) | DatastoreError::Decode(_) => false,
        }
    }

    /// InfluxDB answers `DROP MEASUREMENT` on a missing measurement this way.
    pub fn is_measurement_not_found(&self) -> bool {
        matches!(self, DatastoreError::Query(message) if message.contains("measurement not found"))
    }
}

/// InfluxDB reports a timed out or overloaded request with the bare error
/// text `timeout`. Other errors merely mentioning the word are fatal.
pub(crate) fn is_timeout_message(message: &str) -> bool {
    message.trim().eq_ignore_ascii_case("timeout")
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Names of all measurements in `database`, in the order the server reports them.
    async fn list_measurements(&self, database: &str) -> Result<Vec<String>, DatastoreError>;

    /// Field keys of a measurement, in the order the server reports them.
    async fn describe_fields(
        &self,
        database: &str,
        measurement: &str,
    ) -> Result<Vec<FieldInfo>, DatastoreError>;

    async fn execute(
        &self,
        database: &str,
        statement: &Statement,
    ) -> Result<QueryOutcome, DatastoreError>;
}
