//! Execution of a measurement's query plan.
//!
//! The six steps run strictly in order:
//!
//! 1. drop a leftover staging measurement
//! 2. aggregate every (field, window) into the staging measurement, then
//!    copy unmatched fields through
//! 3. drop the original measurement
//! 4. copy the staging measurement back under the original name
//! 5. drop the staging measurement
//! 6. report the number of restored points
//!
//! The phase is journaled before each step. A failure leaves the journal
//! entry in `Failed` with the phase it stopped in, and
//! [`DownsampleExecutor::resume`] finishes a swap whose original was already
//! dropped.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointEntry, CheckpointStore, MeasurementPhase};
use crate::datastore::Datastore;
use crate::error::{DownsampleError, Result};
use crate::metrics::DownsampleMetrics;
use crate::planner::{MeasurementQueryPlan, Statement, format_interval};
use crate::retry::RetryDriver;

/// Outcome of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub phase: MeasurementPhase,
    pub statement: String,
    /// Field and window index of an aggregation.
    pub field_key: Option<String>,
    pub window_index: Option<usize>,
    pub written: u64,
}

/// Outcome of one measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementReport {
    pub database: String,
    pub measurement: String,
    pub steps: Vec<StepReport>,
    /// Points written back by the restore step.
    pub restored: u64,
    /// Phase a resumed swap was picked up from.
    pub resumed_from: Option<MeasurementPhase>,
    pub dry_run: bool,
    pub duration: Duration,
}

impl MeasurementReport {
    fn new(database: &str, measurement: &str, dry_run: bool) -> Self {
        Self {
            database: database.to_string(),
            measurement: measurement.to_string(),
            steps: Vec::new(),
            restored: 0,
            resumed_from: None,
            dry_run,
            duration: Duration::ZERO,
        }
    }

    pub fn resumed(&self) -> bool {
        self.resumed_from.is_some()
    }

    /// Points written into the staging measurement.
    pub fn aggregated(&self) -> u64 {
        self.steps
            .iter()
            .filter(|step| step.phase == MeasurementPhase::Aggregating)
            .map(|step| step.written)
            .sum()
    }
}

/// The journal entry of the measurement being processed.
struct Journal<'a> {
    store: &'a dyn CheckpointStore,
    entry: CheckpointEntry,
}

impl<'a> Journal<'a> {
    fn new(store: &'a dyn CheckpointStore, database: &str, measurement: &str, temp: &str) -> Self {
        Self {
            store,
            entry: CheckpointEntry::new(database, measurement, temp, MeasurementPhase::Pending),
        }
    }

    fn phase(&self) -> MeasurementPhase {
        self.entry.phase
    }

    async fn enter(&mut self, phase: MeasurementPhase) -> Result<()> {
        self.entry.phase = phase;
        self.entry.updated_at = Utc::now();
        self.store.record(self.entry.clone()).await?;
        Ok(())
    }

    async fn fail(self, error: &DownsampleError) {
        let entry = self.entry.fail(error);
        let phase = entry.failed_at;
        if let Err(e) = self.store.record(entry).await {
            error!(error = %e, "Failed to journal measurement failure");
        }
        debug!(?phase, "Journaled failure");
    }

    async fn clear(self) -> Result<()> {
        self.store
            .clear(&self.entry.database, &self.entry.measurement)
            .await?;
        Ok(())
    }
}

pub struct DownsampleExecutor {
    datastore: Arc<dyn Datastore>,
    retry: RetryDriver,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: DownsampleMetrics,
    dry_run: bool,
}

impl DownsampleExecutor {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        retry: RetryDriver,
        checkpoints: Arc<dyn CheckpointStore>,
        metrics: DownsampleMetrics,
    ) -> Self {
        Self {
            datastore,
            retry,
            checkpoints,
            metrics,
            dry_run: false,
        }
    }

    /// Log statements instead of running them. Nothing is journaled.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run one statement through the retry driver.
    ///
    /// Dropping a measurement that does not exist succeeds.
    async fn run_statement(&self, database: &str, statement: &Statement) -> Result<u64> {
        let operation = statement.to_string();
        let datastore = self.datastore.as_ref();
        let outcome = self
            .retry
            .run(&operation, move || datastore.execute(database, statement))
            .await;

        let written = match outcome {
            Ok(outcome) => outcome.written,
            Err(DownsampleError::Datastore { source, .. })
                if matches!(statement, Statement::DropMeasurement { .. })
                    && source.is_measurement_not_found() =>
            {
                debug!(database, statement = %statement, "Measurement already absent");
                0
            }
            Err(e) => return Err(e),
        };

        self.metrics.record_statement(written);
        Ok(written)
    }

    async fn step(
        &self,
        database: &str,
        phase: MeasurementPhase,
        statement: &Statement,
        report: &mut MeasurementReport,
    ) -> Result<u64> {
        let written = self.run_statement(database, statement).await?;
        report.steps.push(StepReport {
            phase,
            statement: statement.to_string(),
            field_key: None,
            window_index: None,
            written,
        });
        Ok(written)
    }

    /// Downsample one measurement in place.
    pub async fn execute(
        &self,
        database: &str,
        plan: &MeasurementQueryPlan,
    ) -> Result<MeasurementReport> {
        if self.dry_run {
            return Ok(self.describe(database, plan));
        }

        let started = Instant::now();
        self.metrics.record_measurement_start();
        info!(
            database,
            measurement = %plan.measurement,
            aggregations = plan.aggregations.len(),
            passthrough = plan.passthrough.len(),
            "Downsampling measurement"
        );

        let mut journal = Journal::new(
            self.checkpoints.as_ref(),
            database,
            &plan.measurement,
            &plan.temp_measurement,
        );
        let mut report = MeasurementReport::new(database, &plan.measurement, false);

        match self.run_plan(database, plan, &mut journal, &mut report).await {
            Ok(()) => {
                journal.clear().await?;
                report.duration = started.elapsed();
                self.metrics
                    .record_measurement_success(report.restored, report.duration);
                info!(
                    database,
                    measurement = %plan.measurement,
                    aggregated = report.aggregated(),
                    restored = report.restored,
                    duration = %humantime::format_duration(truncate_millis(report.duration)),
                    "Measurement downsampled"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    database,
                    measurement = %plan.measurement,
                    phase = %journal.phase(),
                    error = %e,
                    "Downsampling failed"
                );
                self.metrics.record_measurement_failure();
                journal.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn run_plan(
        &self,
        database: &str,
        plan: &MeasurementQueryPlan,
        journal: &mut Journal<'_>,
        report: &mut MeasurementReport,
    ) -> Result<()> {
        journal.enter(MeasurementPhase::DroppingTemp).await?;
        self.step(
            database,
            MeasurementPhase::DroppingTemp,
            &plan.drop_temp(),
            report,
        )
        .await?;

        journal.enter(MeasurementPhase::Aggregating).await?;
        for step in &plan.aggregations {
            let written = self.run_statement(database, &step.statement).await?;
            info!(
                database,
                measurement = %plan.measurement,
                field = %step.field_key,
                window = step.window_index,
                interval = %step.interval.map(format_interval).unwrap_or_else(|| "raw".to_string()),
                written,
                "Aggregated window"
            );
            report.steps.push(StepReport {
                phase: MeasurementPhase::Aggregating,
                statement: step.statement.to_string(),
                field_key: Some(step.field_key.clone()),
                window_index: Some(step.window_index),
                written,
            });
        }
        for step in &plan.passthrough {
            let written = self.run_statement(database, &step.statement).await?;
            debug!(
                database,
                measurement = %plan.measurement,
                field = %step.field.key,
                field_type = %step.field.field_type,
                written,
                "Copied field unchanged"
            );
            report.steps.push(StepReport {
                phase: MeasurementPhase::Aggregating,
                statement: step.statement.to_string(),
                field_key: Some(step.field.key.clone()),
                window_index: None,
                written,
            });
        }

        self.swap(
            database,
            &plan.measurement,
            &plan.temp_measurement,
            MeasurementPhase::DroppingOriginal,
            journal,
            report,
        )
        .await
    }

    /// Steps 3 to 5, starting at `from`.
    async fn swap(
        &self,
        database: &str,
        measurement: &str,
        temp_measurement: &str,
        from: MeasurementPhase,
        journal: &mut Journal<'_>,
        report: &mut MeasurementReport,
    ) -> Result<()> {
        let drop_original = Statement::DropMeasurement {
            measurement: measurement.to_string(),
        };
        let restore = Statement::CopyAll {
            source: temp_measurement.to_string(),
            target: measurement.to_string(),
        };
        let drop_temp = Statement::DropMeasurement {
            measurement: temp_measurement.to_string(),
        };

        if from == MeasurementPhase::DroppingOriginal {
            journal.enter(MeasurementPhase::DroppingOriginal).await?;
            self.step(
                database,
                MeasurementPhase::DroppingOriginal,
                &drop_original,
                report,
            )
            .await?;
        }

        if matches!(
            from,
            MeasurementPhase::DroppingOriginal | MeasurementPhase::Restoring
        ) {
            journal.enter(MeasurementPhase::Restoring).await?;
            let restored = self
                .step(database, MeasurementPhase::Restoring, &restore, report)
                .await?;
            report.restored = restored;
        }

        journal.enter(MeasurementPhase::DroppingTempAfterRestore).await?;
        self.step(
            database,
            MeasurementPhase::DroppingTempAfterRestore,
            &drop_temp,
            report,
        )
        .await?;

        journal.enter(MeasurementPhase::Done).await
    }

    /// Finish a swap an earlier run left at or after dropping the original.
    ///
    /// Without a staging measurement there is nothing to restore from, so the
    /// entry is dropped and the measurement left untouched.
    pub async fn resume(&self, entry: &CheckpointEntry) -> Result<Option<MeasurementReport>> {
        let database = entry.database.as_str();
        let from = entry.last_phase();
        if !from.original_at_risk() {
            return Ok(None);
        }

        if self.dry_run {
            info!(
                database,
                measurement = %entry.measurement,
                phase = %from,
                dry_run = true,
                "Would resume interrupted swap"
            );
            return Ok(None);
        }

        let datastore = self.datastore.as_ref();
        let measurements = self
            .retry
            .run("SHOW MEASUREMENTS", move || {
                datastore.list_measurements(database)
            })
            .await?;
        if from != MeasurementPhase::DroppingTempAfterRestore
            && !measurements.contains(&entry.temp_measurement)
        {
            warn!(
                database,
                measurement = %entry.measurement,
                temp_measurement = %entry.temp_measurement,
                phase = %from,
                "Staging measurement is gone, nothing to resume"
            );
            self.checkpoints
                .clear(database, &entry.measurement)
                .await?;
            return Ok(None);
        }

        let started = Instant::now();
        self.metrics.record_measurement_start();
        self.metrics.record_resume();
        warn!(
            database,
            measurement = %entry.measurement,
            phase = %from,
            "Resuming interrupted swap"
        );

        let mut journal = Journal::new(
            self.checkpoints.as_ref(),
            database,
            &entry.measurement,
            &entry.temp_measurement,
        );
        let mut report = MeasurementReport::new(database, &entry.measurement, false);
        report.resumed_from = Some(from);

        match self
            .swap(
                database,
                &entry.measurement,
                &entry.temp_measurement,
                from,
                &mut journal,
                &mut report,
            )
            .await
        {
            Ok(()) => {
                journal.clear().await?;
                report.duration = started.elapsed();
                self.metrics
                    .record_measurement_success(report.restored, report.duration);
                info!(
                    database,
                    measurement = %entry.measurement,
                    restored = report.restored,
                    "Resumed swap completed"
                );
                Ok(Some(report))
            }
            Err(e) => {
                self.metrics.record_measurement_failure();
                journal.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Log the plan without executing it.
    fn describe(&self, database: &str, plan: &MeasurementQueryPlan) -> MeasurementReport {
        let mut report = MeasurementReport::new(database, &plan.measurement, true);
        let aggregations = plan.aggregations.len() + plan.passthrough.len();

        for (index, statement) in plan.statements().into_iter().enumerate() {
            let phase = match index {
                0 => MeasurementPhase::DroppingTemp,
                i if i <= aggregations => MeasurementPhase::Aggregating,
                i if i == aggregations + 1 => MeasurementPhase::DroppingOriginal,
                i if i == aggregations + 2 => MeasurementPhase::Restoring,
                _ => MeasurementPhase::DroppingTempAfterRestore,
            };
            info!(
                database,
                measurement = %plan.measurement,
                phase = %phase,
                statement = %statement,
                dry_run = true,
                "Planned statement"
            );
            report.steps.push(StepReport {
                phase,
                statement: statement.to_string(),
                field_key: None,
                window_index: None,
                written: 0,
            });
        }
        report
    }
}

fn truncate_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::datastore::memory::FieldValue;
    use crate::datastore::{FieldInfo, FieldType, InMemoryDatastore};
    use crate::matcher::{MatchedField, MeasurementPlan};
    use crate::planner::plan_measurement;
    use crate::retry::RetryPolicy;
    use crate::schema::{AggregationFunction, ReferenceTime, build_windows, parse_retentions};
    use chrono::{DateTime, TimeDelta, TimeZone};

    fn reference() -> ReferenceTime {
        ReferenceTime::at(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap())
    }

    fn plan() -> MeasurementQueryPlan {
        let tiers = parse_retentions("1h:1d,*:*").unwrap();
        plan_measurement(&MeasurementPlan {
            name: "weather".to_string(),
            fields: vec![MatchedField {
                key: "temp".to_string(),
                field_type: FieldType::Float,
                retentions: build_windows(&reference(), &tiers).unwrap(),
                function: AggregationFunction::Mean,
                policy_index: 0,
            }],
            passthrough: vec![FieldInfo::new("station", FieldType::String)],
        })
    }

    fn datastore() -> Arc<InMemoryDatastore> {
        let store = Arc::new(InMemoryDatastore::new());
        let t = reference().instant();
        let points: [(DateTime<Utc>, f64); 4] = [
            (t - TimeDelta::days(3), 1.0),
            (t - TimeDelta::minutes(50), 2.0),
            (t - TimeDelta::minutes(40), 4.0),
            (t - TimeDelta::minutes(10), 9.0),
        ];
        for (timestamp, value) in points {
            store.insert(
                "telegraf",
                "weather",
                &[("site", "north")],
                timestamp,
                vec![
                    ("temp", FieldValue::Float(value)),
                    ("station", FieldValue::String("n1".to_string())),
                ],
            );
        }
        store
    }

    fn executor(
        datastore: Arc<InMemoryDatastore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        metrics: DownsampleMetrics,
    ) -> DownsampleExecutor {
        DownsampleExecutor::new(
            datastore,
            RetryDriver::new(
                RetryPolicy::unbounded(Duration::from_secs(10)),
                metrics.clone(),
            ),
            checkpoints,
            metrics,
        )
    }

    #[tokio::test]
    async fn test_statements_run_in_order() {
        let datastore = datastore();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let executor = executor(
            datastore.clone(),
            checkpoints.clone(),
            DownsampleMetrics::new(),
        );
        let plan = plan();

        let report = executor.execute("telegraf", &plan).await.unwrap();

        assert_eq!(datastore.executed(), plan.statements());
        assert_eq!(report.steps.len(), 7);
        assert_eq!(report.steps[1].field_key.as_deref(), Some("temp"));
        assert_eq!(report.steps[1].window_index, Some(0));
        // Hourly window holds one bucket, the raw window one point
        assert_eq!(report.steps[1].written, 1);
        assert_eq!(report.steps[2].written, 1);
        assert_eq!(report.steps[3].written, 4);
        assert_eq!(report.aggregated(), 6);
        // Station values keep their own timestamps
        assert_eq!(report.restored, 5);
        assert!(!report.resumed());

        assert!(!datastore.has_measurement("telegraf", "weather_downsample_temp"));
        assert!(checkpoints.entries("telegraf").await.unwrap().is_empty());

        let points = datastore.points("telegraf", "weather");
        assert_eq!(points.len(), 5);
        assert_eq!(
            points[0].fields["station"],
            FieldValue::String("n1".to_string())
        );
        assert_eq!(
            points[1].timestamp,
            reference().instant() - TimeDelta::hours(1)
        );
        assert_eq!(points[1].fields["temp"], FieldValue::Float(5.0));
        assert_eq!(points[1].tags["site"], "north");
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let datastore = datastore();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let executor = executor(
            datastore.clone(),
            checkpoints.clone(),
            DownsampleMetrics::new(),
        )
        .with_dry_run(true);
        let plan = plan();

        let report = executor.execute("telegraf", &plan).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.steps.len(), plan.statements().len());
        assert_eq!(report.steps[0].phase, MeasurementPhase::DroppingTemp);
        assert_eq!(report.steps[3].phase, MeasurementPhase::Aggregating);
        assert_eq!(report.steps[4].phase, MeasurementPhase::DroppingOriginal);
        assert_eq!(report.steps[5].phase, MeasurementPhase::Restoring);
        assert_eq!(
            report.steps[6].phase,
            MeasurementPhase::DroppingTempAfterRestore
        );
        assert!(datastore.executed().is_empty());
        assert_eq!(datastore.points("telegraf", "weather").len(), 4);
        assert!(checkpoints.entries("telegraf").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let datastore = datastore();
        let metrics = DownsampleMetrics::new();
        let executor = executor(
            datastore.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            metrics.clone(),
        );

        datastore.fail_with_timeouts(3);
        let report = executor.execute("telegraf", &plan()).await.unwrap();

        assert_eq!(report.restored, 5);
        assert_eq!(metrics.retries_attempted(), 3);
        assert_eq!(metrics.measurements_succeeded(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_journaled_then_resumed() {
        let datastore = datastore();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let metrics = DownsampleMetrics::new();
        let executor = executor(datastore.clone(), checkpoints.clone(), metrics.clone());

        datastore.fail_on(|statement| matches!(statement, Statement::CopyAll { .. }));
        let err = executor.execute("telegraf", &plan()).await.unwrap_err();
        assert!(matches!(err, DownsampleError::Datastore { .. }));

        // The original is gone, only the staging copy remains
        assert!(!datastore.has_measurement("telegraf", "weather"));
        assert!(datastore.has_measurement("telegraf", "weather_downsample_temp"));

        let entry = checkpoints.get("telegraf", "weather").await.unwrap();
        assert_eq!(entry.phase, MeasurementPhase::Failed);
        assert_eq!(entry.failed_at, Some(MeasurementPhase::Restoring));
        assert!(entry.needs_resume());

        datastore.clear_faults();
        let report = executor.resume(&entry).await.unwrap().unwrap();

        assert_eq!(report.resumed_from, Some(MeasurementPhase::Restoring));
        assert_eq!(report.restored, 5);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(datastore.points("telegraf", "weather").len(), 5);
        assert!(!datastore.has_measurement("telegraf", "weather_downsample_temp"));
        assert!(checkpoints.get("telegraf", "weather").await.is_none());
        assert_eq!(metrics.measurements_failed(), 1);
        assert_eq!(metrics.measurements_resumed(), 1);
    }

    #[tokio::test]
    async fn test_early_failure_keeps_original() {
        let datastore = datastore();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let executor = executor(
            datastore.clone(),
            checkpoints.clone(),
            DownsampleMetrics::new(),
        );

        datastore.fail_on(|statement| matches!(statement, Statement::SelectInto(_)));
        executor.execute("telegraf", &plan()).await.unwrap_err();

        assert_eq!(datastore.points("telegraf", "weather").len(), 4);
        let entry = checkpoints.get("telegraf", "weather").await.unwrap();
        assert_eq!(entry.failed_at, Some(MeasurementPhase::Aggregating));
        assert!(!entry.needs_resume());
        assert!(executor.resume(&entry).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_without_staging_measurement_is_skipped() {
        let datastore = datastore();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let executor = executor(
            datastore.clone(),
            checkpoints.clone(),
            DownsampleMetrics::new(),
        );

        let entry = CheckpointEntry::new(
            "telegraf",
            "weather",
            "weather_downsample_temp",
            MeasurementPhase::DroppingOriginal,
        );
        checkpoints.record(entry.clone()).await.unwrap();

        assert!(executor.resume(&entry).await.unwrap().is_none());
        assert_eq!(datastore.points("telegraf", "weather").len(), 4);
        assert!(checkpoints.get("telegraf", "weather").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_measurement_drop_is_tolerated() {
        let datastore = Arc::new(InMemoryDatastore::new().with_missing_measurement_errors());
        datastore.insert(
            "telegraf",
            "weather",
            &[],
            reference().instant() - TimeDelta::hours(2),
            vec![("temp", FieldValue::Float(1.0))],
        );
        let executor = executor(
            datastore.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            DownsampleMetrics::new(),
        );

        let report = executor.execute("telegraf", &plan()).await.unwrap();
        assert_eq!(report.steps[0].written, 0);
        assert_eq!(report.restored, 1);
    }
}
