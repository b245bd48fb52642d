//! The downsampling run loop.
//!
//! Databases are processed one at a time, measurements within a database one
//! at a time. Before a database is matched, swaps an earlier run left after
//! dropping the original are finished, so the usual staging cleanup can never
//! destroy the only copy of a measurement's data. Any error aborts the run.

use chrono::{DateTime, Utc};
use common::Configuration;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, NoopCheckpointStore};
use crate::datastore::{Datastore, InfluxClient};
use crate::error::{DownsampleError, Result};
use crate::executor::{DownsampleExecutor, MeasurementReport};
use crate::matcher::find_matching_measurements;
use crate::metrics::DownsampleMetrics;
use crate::planner::plan_measurement;
use crate::retry::{RetryDriver, RetryPolicy};
use crate::schema::CompiledSchema;

/// Measurements processed in one database.
#[derive(Debug, Clone)]
pub struct DatabaseReport {
    pub database: String,
    pub measurements: Vec<MeasurementReport>,
}

/// Result of a complete run across all databases
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub reference_time: DateTime<Utc>,
    pub dry_run: bool,
    pub databases: Vec<DatabaseReport>,
}

impl RunReport {
    pub fn measurements(&self) -> impl Iterator<Item = &MeasurementReport> {
        self.databases.iter().flat_map(|db| db.measurements.iter())
    }

    pub fn total_restored(&self) -> u64 {
        self.measurements().map(|m| m.restored).sum()
    }
}

pub struct Downsampler {
    schema: CompiledSchema,
    datastore: Arc<dyn Datastore>,
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryDriver,
    executor: DownsampleExecutor,
    metrics: DownsampleMetrics,
    dry_run: bool,
}

impl Downsampler {
    pub fn new(
        schema: CompiledSchema,
        datastore: Arc<dyn Datastore>,
        checkpoints: Arc<dyn CheckpointStore>,
        dry_run: bool,
    ) -> Self {
        let metrics = DownsampleMetrics::new();
        let retry = RetryDriver::new(RetryPolicy::from(&schema.retry), metrics.clone());
        let executor = DownsampleExecutor::new(
            datastore.clone(),
            retry.clone(),
            checkpoints.clone(),
            metrics.clone(),
        )
        .with_dry_run(dry_run);

        Self {
            schema,
            datastore,
            checkpoints,
            retry,
            executor,
            metrics,
            dry_run,
        }
    }

    /// Compile the schema and connect to the InfluxDB server it names.
    pub fn from_config(config: &Configuration) -> Result<Self> {
        let schema = CompiledSchema::compile(config)?;
        let client = InfluxClient::from_config(config).map_err(|source| {
            DownsampleError::Datastore {
                operation: "connect".to_string(),
                source,
            }
        })?;
        let checkpoints: Arc<dyn CheckpointStore> = if config.checkpoint.enabled {
            Arc::new(FileCheckpointStore::new(&config.checkpoint.path))
        } else {
            Arc::new(NoopCheckpointStore)
        };

        Ok(Self::new(
            schema,
            Arc::new(client),
            checkpoints,
            config.dry_run,
        ))
    }

    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    pub fn metrics(&self) -> &DownsampleMetrics {
        &self.metrics
    }

    /// Downsample every configured database.
    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        info!(
            run_id = %run_id,
            databases = self.schema.databases.len(),
            policies = self.schema.policies.len(),
            reference_time = %self.schema.reference_time,
            dry_run = self.dry_run,
            "Starting downsampling run"
        );

        let mut databases = Vec::with_capacity(self.schema.databases.len());
        for database in &self.schema.databases {
            match self.run_database(database).await {
                Ok(report) => databases.push(report),
                Err(e) => {
                    warn!(
                        run_id = %run_id,
                        database = %database,
                        error = %e,
                        "Downsampling run aborted"
                    );
                    self.metrics.summary().log();
                    return Err(e);
                }
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            reference_time: self.schema.reference_time.instant(),
            dry_run: self.dry_run,
            databases,
        };

        info!(
            run_id = %run_id,
            measurements = report.measurements().count(),
            restored = report.total_restored(),
            "Downsampling run completed"
        );
        self.metrics.summary().log();

        Ok(report)
    }

    /// Resume interrupted swaps, then downsample every matched measurement.
    pub async fn run_database(&self, database: &str) -> Result<DatabaseReport> {
        info!(database, "Processing database");
        let mut measurements = Vec::new();
        let mut resumed = HashSet::new();

        for entry in self.checkpoints.entries(database).await? {
            if entry.needs_resume() {
                if let Some(report) = self.executor.resume(&entry).await? {
                    resumed.insert(report.measurement.clone());
                    measurements.push(report);
                }
            } else if !self.dry_run {
                // The original is still intact, the normal run redoes the work
                info!(
                    database,
                    measurement = %entry.measurement,
                    phase = %entry.last_phase(),
                    "Discarding stale checkpoint"
                );
                self.checkpoints
                    .clear(database, &entry.measurement)
                    .await?;
            }
        }

        let plans =
            find_matching_measurements(&self.schema, database, self.datastore.as_ref(), &self.retry)
                .await?;

        for plan in plans {
            if resumed.contains(&plan.name) {
                info!(database, measurement = %plan.name, "Already completed by resume");
                continue;
            }
            let query_plan = plan_measurement(&plan);
            measurements.push(self.executor.execute(database, &query_plan).await?);
        }

        Ok(DatabaseReport {
            database: database.to_string(),
            measurements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointEntry, MeasurementPhase, MemoryCheckpointStore};
    use crate::datastore::InMemoryDatastore;
    use crate::datastore::memory::FieldValue;
    use crate::planner::Statement;
    use crate::schema::ReferenceTime;
    use chrono::{TimeDelta, TimeZone};
    use common::config::{PatternConfig, PolicyConfig};

    fn reference() -> ReferenceTime {
        ReferenceTime::at(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap())
    }

    fn schema(databases: &[&str]) -> CompiledSchema {
        let config = Configuration {
            databases: databases.iter().map(|d| d.to_string()).collect(),
            policies: vec![PolicyConfig {
                pattern: PatternConfig {
                    measurement: Some("cpu".to_string()),
                    ..Default::default()
                },
                retentions: "1h:1d,*:*".to_string(),
                function: None,
            }],
            ..Default::default()
        };
        CompiledSchema::compile_at(&config, reference()).unwrap()
    }

    fn seed(datastore: &InMemoryDatastore, database: &str, measurement: &str) {
        let t = reference().instant();
        for minutes in [30, 90, 3_000] {
            datastore.insert(
                database,
                measurement,
                &[("host", "a")],
                t - TimeDelta::minutes(minutes),
                vec![("usage", FieldValue::Float(minutes as f64))],
            );
        }
    }

    #[tokio::test]
    async fn test_run_processes_matching_measurements() {
        let datastore = Arc::new(InMemoryDatastore::new());
        seed(&datastore, "telegraf", "cpu");
        seed(&datastore, "telegraf", "disk");
        seed(&datastore, "other", "cpu");

        let downsampler = Downsampler::new(
            schema(&["telegraf", "other"]),
            datastore.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            false,
        );
        let report = downsampler.run().await.unwrap();

        assert_eq!(report.databases.len(), 2);
        assert_eq!(report.databases[0].measurements.len(), 1);
        assert_eq!(report.databases[0].measurements[0].measurement, "cpu");
        assert_eq!(report.measurements().count(), 2);
        assert_eq!(report.reference_time, reference().instant());
        // Untouched measurement keeps its raw points
        assert_eq!(datastore.points("telegraf", "disk").len(), 3);
        assert_eq!(downsampler.metrics().measurements_succeeded(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_the_run() {
        let datastore = Arc::new(InMemoryDatastore::new());
        seed(&datastore, "telegraf", "cpu");
        seed(&datastore, "other", "cpu");
        datastore.fail_on(|statement| matches!(statement, Statement::SelectInto(_)));

        let downsampler = Downsampler::new(
            schema(&["telegraf", "other"]),
            datastore.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            false,
        );
        downsampler.run().await.unwrap_err();

        // The second database was never touched
        assert!(
            datastore
                .executed()
                .iter()
                .all(|s| !matches!(s, Statement::CopyAll { .. }))
        );
        assert_eq!(downsampler.metrics().measurements_started(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_swap_is_resumed_before_cleanup() {
        let datastore = Arc::new(InMemoryDatastore::new());
        // Original already dropped, only the staging copy is left
        seed(&datastore, "telegraf", "cpu_downsample_temp");
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints
            .record(
                CheckpointEntry::new(
                    "telegraf",
                    "cpu",
                    "cpu_downsample_temp",
                    MeasurementPhase::Restoring,
                )
                .fail("connection reset"),
            )
            .await
            .unwrap();

        let downsampler = Downsampler::new(
            schema(&["telegraf"]),
            datastore.clone(),
            checkpoints.clone(),
            false,
        );
        let report = downsampler.run().await.unwrap();

        let measurements = &report.databases[0].measurements;
        assert_eq!(measurements.len(), 1);
        assert!(measurements[0].resumed());
        assert_eq!(datastore.points("telegraf", "cpu").len(), 3);
        assert!(!datastore.has_measurement("telegraf", "cpu_downsample_temp"));
        assert!(checkpoints.entries("telegraf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_discarded() {
        let datastore = Arc::new(InMemoryDatastore::new());
        seed(&datastore, "telegraf", "cpu");
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints
            .record(CheckpointEntry::new(
                "telegraf",
                "cpu",
                "cpu_downsample_temp",
                MeasurementPhase::Aggregating,
            ))
            .await
            .unwrap();

        let downsampler = Downsampler::new(
            schema(&["telegraf"]),
            datastore.clone(),
            checkpoints.clone(),
            false,
        );
        let report = downsampler.run().await.unwrap();

        assert!(!report.databases[0].measurements[0].resumed());
        assert!(checkpoints.entries("telegraf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let datastore = Arc::new(InMemoryDatastore::new());
        seed(&datastore, "telegraf", "cpu");
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let downsampler = Downsampler::new(
            schema(&["telegraf"]),
            datastore.clone(),
            checkpoints.clone(),
            true,
        );
        let report = downsampler.run().await.unwrap();

        assert!(report.dry_run);
        assert!(report.databases[0].measurements[0].dry_run);
        assert!(datastore.executed().is_empty());
        assert_eq!(datastore.points("telegraf", "cpu").len(), 3);
        assert_eq!(report.total_restored(), 0);
    }
}
