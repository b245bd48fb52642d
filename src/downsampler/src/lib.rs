//! InfluxDB downsampling engine
//!
//! Compiles a retention schema into per-field aggregation statements and
//! replaces each matched measurement with its downsampled copy:
//! - Schema compilation against a single reference time
//! - Measurement and field matching with explicit policy precedence
//! - Typed InfluxQL statement plans
//! - Retry of transient datastore failures
//! - A journaled swap that can be resumed after a crash

pub mod checkpoint;
pub mod datastore;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod metrics;
pub mod planner;
pub mod retry;
pub mod runner;
pub mod schema;

// Re-export commonly used types
pub use checkpoint::{
    CheckpointEntry, CheckpointError, CheckpointStore, FileCheckpointStore, MeasurementPhase,
    MemoryCheckpointStore, NoopCheckpointStore,
};
pub use datastore::{
    Datastore, DatastoreError, FieldInfo, FieldType, InMemoryDatastore, InfluxClient, QueryOutcome,
};
pub use error::DownsampleError;
pub use executor::{DownsampleExecutor, MeasurementReport, StepReport};
pub use matcher::{MatchedField, MeasurementPlan, find_matching_measurements};
pub use metrics::{DownsampleMetrics, MetricsSummary};
pub use planner::{MeasurementQueryPlan, Statement, plan_measurement};
pub use retry::{RetryDriver, RetryPolicy};
pub use runner::{DatabaseReport, Downsampler, RunReport};
pub use schema::{CompiledSchema, Policy, ReferenceTime, RetentionWindow, SchemaError};
