use std::time::Duration;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::datastore::DatastoreError;
use crate::schema::SchemaError;

/// Errors that abort a downsampling run.
#[derive(Error, Debug)]
pub enum DownsampleError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A non-retryable datastore failure.
    #[error("{operation} failed: {source}")]
    Datastore {
        operation: String,
        #[source]
        source: DatastoreError,
    },

    /// A bounded retry policy gave up on a transient failure.
    #[error("{operation} still failing after {attempts} attempts over {elapsed:?}: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: DatastoreError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl DownsampleError {
    /// The datastore error behind this failure, if any.
    pub fn datastore_error(&self) -> Option<&DatastoreError> {
        match self {
            DownsampleError::Datastore { source, .. }
            | DownsampleError::RetriesExhausted { source, .. } => Some(source),
            DownsampleError::Schema(_) | DownsampleError::Checkpoint(_) => None,
        }
    }
}

pub type Result<T, E = DownsampleError> = std::result::Result<T, E>;
