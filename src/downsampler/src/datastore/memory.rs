//! In-memory datastore that interprets [`Statement`]s the way InfluxDB 1.x
//! does for the subset the downsampler emits.
//!
//! Points are keyed by series (tag set) and timestamp; writing a field to an
//! existing point merges it. Buckets of `GROUP BY time(..)` are aligned to
//! the Unix epoch and stamped with their start. Faults can be injected to
//! drive the retry and resume paths.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{Datastore, DatastoreError, FieldInfo, FieldType, QueryOutcome};
use crate::planner::{SelectInto, Selection, Statement};

pub type Tags = BTreeMap<String, String>;
type Fields = BTreeMap<String, FieldValue>;
type Series = BTreeMap<DateTime<Utc>, Fields>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Boolean(_) => FieldType::Boolean,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// A stored point, as returned by [`InMemoryDatastore::points`].
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

type StatementFilter = Box<dyn Fn(&Statement) -> bool + Send + Sync>;

#[derive(Default)]
struct Faults {
    timeouts: usize,
    fatal: Option<StatementFilter>,
}

#[derive(Default)]
struct State {
    databases: BTreeMap<String, BTreeMap<String, BTreeMap<Tags, Series>>>,
    executed: Vec<Statement>,
    faults: Faults,
}

#[derive(Default)]
pub struct InMemoryDatastore {
    state: Mutex<State>,
    missing_measurement_errors: bool,
}

impl std::fmt::Debug for InMemoryDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDatastore")
            .field(
                "missing_measurement_errors",
                &self.missing_measurement_errors,
            )
            .finish_non_exhaustive()
    }
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `DROP MEASUREMENT` on a missing measurement with
    /// `measurement not found`, like some InfluxDB releases do.
    pub fn with_missing_measurement_errors(mut self) -> Self {
        self.missing_measurement_errors = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_database(&self, database: &str) {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default();
    }

    /// Write one point, creating the database and measurement as needed.
    pub fn insert(
        &self,
        database: &str,
        measurement: &str,
        tags: &[(&str, &str)],
        timestamp: DateTime<Utc>,
        fields: Vec<(&str, FieldValue)>,
    ) {
        let tags: Tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut state = self.state();
        let point = state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(measurement.to_string())
            .or_default()
            .entry(tags)
            .or_default()
            .entry(timestamp)
            .or_default();
        for (key, value) in fields {
            point.insert(key.to_string(), value);
        }
    }

    pub fn has_measurement(&self, database: &str, measurement: &str) -> bool {
        self.state()
            .databases
            .get(database)
            .is_some_and(|measurements| measurements.contains_key(measurement))
    }

    /// All points of a measurement ordered by tag set, then time.
    pub fn points(&self, database: &str, measurement: &str) -> Vec<Point> {
        let state = self.state();
        let Some(series) = state
            .databases
            .get(database)
            .and_then(|measurements| measurements.get(measurement))
        else {
            return Vec::new();
        };

        series
            .iter()
            .flat_map(|(tags, points)| {
                points.iter().map(move |(timestamp, fields)| Point {
                    tags: tags.clone(),
                    timestamp: *timestamp,
                    fields: fields.clone(),
                })
            })
            .collect()
    }

    /// Statements that were applied, in order.
    pub fn executed(&self) -> Vec<Statement> {
        self.state().executed.clone()
    }

    /// Fail the next `count` statements with a timeout.
    pub fn fail_with_timeouts(&self, count: usize) {
        self.state().faults.timeouts = count;
    }

    /// Fail every statement accepted by `filter` with a non-retryable error.
    pub fn fail_on(&self, filter: impl Fn(&Statement) -> bool + Send + Sync + 'static) {
        self.state().faults.fatal = Some(Box::new(filter));
    }

    pub fn clear_faults(&self) {
        self.state().faults = Faults::default();
    }
}

fn database_not_found(database: &str) -> DatastoreError {
    DatastoreError::Query(format!("database not found: {database}"))
}

/// Start of the epoch-aligned bucket holding `timestamp`.
fn bucket_start(timestamp: DateTime<Utc>, width_secs: i64) -> DateTime<Utc> {
    let secs = timestamp.timestamp();
    let start = secs - secs.rem_euclid(width_secs);
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(start)
}

fn aggregate(
    function: &str,
    values: &[(DateTime<Utc>, FieldValue)],
) -> Result<FieldValue, DatastoreError> {
    let unsupported = || {
        DatastoreError::Query(format!(
            "unsupported {} iterator type",
            function.to_ascii_lowercase()
        ))
    };
    let numbers = || -> Result<Vec<f64>, DatastoreError> {
        values
            .iter()
            .map(|(_, v)| v.as_f64().ok_or_else(unsupported))
            .collect()
    };
    let all_integers = values.iter().all(|(_, v)| matches!(v, FieldValue::Integer(_)));

    match function {
        "MEAN" => {
            let numbers = numbers()?;
            Ok(FieldValue::Float(numbers.iter().sum::<f64>() / numbers.len() as f64))
        }
        "SUM" => {
            if all_integers {
                let sum = values
                    .iter()
                    .filter_map(|(_, v)| match v {
                        FieldValue::Integer(i) => Some(*i),
                        _ => None,
                    })
                    .sum();
                Ok(FieldValue::Integer(sum))
            } else {
                Ok(FieldValue::Float(numbers()?.iter().sum()))
            }
        }
        "COUNT" => Ok(FieldValue::Integer(values.len() as i64)),
        "FIRST" => values.first().map(|p| p.1.clone()).ok_or_else(unsupported),
        "LAST" => values.last().map(|p| p.1.clone()).ok_or_else(unsupported),
        "MAX" | "MIN" => {
            numbers()?;
            let pick = values
                .iter()
                .map(|(_, v)| v)
                .reduce(|best, v| {
                    let (b, c) = (
                        best.as_f64().unwrap_or_default(),
                        v.as_f64().unwrap_or_default(),
                    );
                    let better = if function == "MAX" { c > b } else { c < b };
                    if better { v } else { best }
                })
                .cloned();
            pick.ok_or_else(unsupported)
        }
        other => Err(DatastoreError::Query(format!(
            "undefined function {}()",
            other.to_ascii_lowercase()
        ))),
    }
}

impl State {
    fn measurements(
        &mut self,
        database: &str,
    ) -> Result<&mut BTreeMap<String, BTreeMap<Tags, Series>>, DatastoreError> {
        self.databases
            .get_mut(database)
            .ok_or_else(|| database_not_found(database))
    }

    fn select_into(&mut self, database: &str, select: &SelectInto) -> Result<u64, DatastoreError> {
        let measurements = self.measurements(database)?;
        let Some(source) = measurements.get(&select.source) else {
            return Ok(0);
        };

        // (tags, timestamp) -> value
        let mut output: Vec<(Tags, DateTime<Utc>, FieldValue)> = Vec::new();

        for (tags, series) in source {
            let values: Vec<(DateTime<Utc>, FieldValue)> = series
                .iter()
                .filter(|(timestamp, _)| select.time_range.contains(**timestamp))
                .filter_map(|(timestamp, fields)| {
                    fields
                        .get(&select.field_key)
                        .map(|value| (*timestamp, value.clone()))
                })
                .collect();
            if values.is_empty() {
                continue;
            }

            match (&select.selection, select.interval) {
                (Selection::Raw, None) => {
                    output.extend(values.into_iter().map(|(ts, v)| (tags.clone(), ts, v)));
                }
                (Selection::Raw, Some(_)) => {
                    return Err(DatastoreError::Query(
                        "GROUP BY requires at least one aggregate function".to_string(),
                    ));
                }
                (Selection::Aggregate(function), interval) => {
                    let name = function.name();
                    let mut buckets: BTreeMap<DateTime<Utc>, Vec<(DateTime<Utc>, FieldValue)>> =
                        BTreeMap::new();
                    for (timestamp, value) in values {
                        let start = match interval {
                            Some(width) => bucket_start(timestamp, width.as_secs().max(1) as i64),
                            None => select.time_range.min.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                        };
                        buckets.entry(start).or_default().push((timestamp, value));
                    }
                    for (start, values) in buckets {
                        output.push((tags.clone(), start, aggregate(&name, &values)?));
                    }
                }
            }
        }

        let written = output.len() as u64;
        if output.is_empty() {
            return Ok(0);
        }
        let target = measurements.entry(select.target.clone()).or_default();
        for (tags, timestamp, value) in output {
            target
                .entry(tags)
                .or_default()
                .entry(timestamp)
                .or_default()
                .insert(select.field_key.clone(), value);
        }
        Ok(written)
    }

    fn copy_all(
        &mut self,
        database: &str,
        source: &str,
        target: &str,
    ) -> Result<u64, DatastoreError> {
        let measurements = self.measurements(database)?;
        let Some(source) = measurements.get(source).filter(|s| !s.is_empty()).cloned() else {
            return Ok(0);
        };

        let mut written = 0;
        let target = measurements.entry(target.to_string()).or_default();
        for (tags, series) in source {
            let target_series = target.entry(tags).or_default();
            for (timestamp, fields) in series {
                target_series.entry(timestamp).or_default().extend(fields);
                written += 1;
            }
        }
        Ok(written)
    }

    fn apply(
        &mut self,
        database: &str,
        statement: &Statement,
        missing_measurement_errors: bool,
    ) -> Result<u64, DatastoreError> {
        match statement {
            Statement::DropMeasurement { measurement } => {
                let removed = self.measurements(database)?.remove(measurement).is_some();
                if !removed && missing_measurement_errors {
                    return Err(DatastoreError::Query("measurement not found".to_string()));
                }
                Ok(0)
            }
            Statement::SelectInto(select) => self.select_into(database, select),
            Statement::CopyAll { source, target } => self.copy_all(database, source, target),
        }
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn list_measurements(&self, database: &str) -> Result<Vec<String>, DatastoreError> {
        let state = self.state();
        let measurements = state
            .databases
            .get(database)
            .ok_or_else(|| database_not_found(database))?;
        Ok(measurements.keys().cloned().collect())
    }

    async fn describe_fields(
        &self,
        database: &str,
        measurement: &str,
    ) -> Result<Vec<FieldInfo>, DatastoreError> {
        let state = self.state();
        let measurements = state
            .databases
            .get(database)
            .ok_or_else(|| database_not_found(database))?;

        let mut fields: BTreeMap<&str, FieldType> = BTreeMap::new();
        let series = measurements.get(measurement).into_iter().flat_map(|s| s.values());
        for points in series {
            for point in points.values() {
                for (key, value) in point {
                    fields.entry(key.as_str()).or_insert_with(|| value.field_type());
                }
            }
        }

        Ok(fields
            .into_iter()
            .map(|(key, field_type)| FieldInfo::new(key, field_type))
            .collect())
    }

    async fn execute(
        &self,
        database: &str,
        statement: &Statement,
    ) -> Result<QueryOutcome, DatastoreError> {
        let mut state = self.state();

        if state.faults.timeouts > 0 {
            state.faults.timeouts -= 1;
            return Err(DatastoreError::Timeout("timeout".to_string()));
        }
        let injected = state.faults.fatal.as_ref();
        if injected.is_some_and(|fatal| fatal(statement)) {
            return Err(DatastoreError::Query(format!("injected failure: {statement}")));
        }

        let written = state.apply(database, statement, self.missing_measurement_errors)?;
        state.executed.push(statement.clone());
        Ok(QueryOutcome { written })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::TimeRange;
    use crate::schema::AggregationFunction;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, hour, minute, 0).unwrap()
    }

    fn seeded() -> InMemoryDatastore {
        let store = InMemoryDatastore::new();
        for (minute, value) in [(0, 1.0), (20, 2.0), (40, 3.0)] {
            store.insert(
                "telegraf",
                "cpu",
                &[("host", "a")],
                at(10, minute),
                vec![("usage", FieldValue::Float(value))],
            );
        }
        store.insert(
            "telegraf",
            "cpu",
            &[("host", "a")],
            at(11, 5),
            vec![
                ("usage", FieldValue::Float(10.0)),
                ("state", FieldValue::String("up".to_string())),
            ],
        );
        store
    }

    fn select(
        selection: Selection,
        interval: Option<Duration>,
        time_range: TimeRange,
    ) -> Statement {
        Statement::SelectInto(SelectInto {
            source: "cpu".to_string(),
            target: "cpu_downsample_temp".to_string(),
            field_key: "usage".to_string(),
            selection,
            time_range,
            interval,
        })
    }

    #[tokio::test]
    async fn test_hourly_mean() {
        let store = seeded();
        let outcome = store
            .execute(
                "telegraf",
                &select(
                    Selection::Aggregate(AggregationFunction::Mean),
                    Some(Duration::from_secs(3_600)),
                    TimeRange::default(),
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.written, 2);
        let points = store.points("telegraf", "cpu_downsample_temp");
        assert_eq!(points[0].timestamp, at(10, 0));
        assert_eq!(points[0].fields["usage"], FieldValue::Float(2.0));
        assert_eq!(points[1].timestamp, at(11, 0));
        assert_eq!(points[1].tags["host"], "a");
    }

    #[tokio::test]
    async fn test_raw_copy_excludes_upper_bound() {
        let store = seeded();
        let outcome = store
            .execute(
                "telegraf",
                &select(
                    Selection::Raw,
                    None,
                    TimeRange {
                        min: Some(at(10, 20)),
                        max: Some(at(11, 5)),
                    },
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.written, 2);
        let points = store.points("telegraf", "cpu_downsample_temp");
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, at(10, 20));
        assert_eq!(points[1].timestamp, at(10, 40));
        assert!(!points[0].fields.contains_key("state"));
    }

    #[tokio::test]
    async fn test_template_functions() {
        let store = seeded();
        let max = AggregationFunction::from_template("max(\"{}\")").unwrap();
        store
            .execute(
                "telegraf",
                &select(
                    Selection::Aggregate(max),
                    Some(Duration::from_secs(86_400)),
                    TimeRange::default(),
                ),
            )
            .await
            .unwrap();
        let points = store.points("telegraf", "cpu_downsample_temp");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, at(0, 0));
        assert_eq!(points[0].fields["usage"], FieldValue::Float(10.0));

        let unknown = AggregationFunction::from_template("SPREAD(\"{}\")").unwrap();
        let err = store
            .execute(
                "telegraf",
                &select(
                    Selection::Aggregate(unknown),
                    Some(Duration::from_secs(60)),
                    TimeRange::default(),
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::Query(_)));
    }

    #[tokio::test]
    async fn test_copy_all_and_drop() {
        let store = seeded();
        let copy = Statement::CopyAll {
            source: "cpu".to_string(),
            target: "cpu_copy".to_string(),
        };
        assert_eq!(store.execute("telegraf", &copy).await.unwrap().written, 4);
        assert_eq!(
            store.points("telegraf", "cpu_copy"),
            store.points("telegraf", "cpu")
        );

        let drop = Statement::DropMeasurement {
            measurement: "cpu".to_string(),
        };
        store.execute("telegraf", &drop).await.unwrap();
        assert!(!store.has_measurement("telegraf", "cpu"));

        // Dropping again is a no-op
        store.execute("telegraf", &drop).await.unwrap();
        assert_eq!(store.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_strict_drop_reports_missing_measurement() {
        let store = InMemoryDatastore::new().with_missing_measurement_errors();
        store.create_database("telegraf");

        let err = store
            .execute(
                "telegraf",
                &Statement::DropMeasurement {
                    measurement: "nope".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_measurement_not_found());
    }

    #[tokio::test]
    async fn test_metadata() {
        let store = seeded();
        assert_eq!(
            store.list_measurements("telegraf").await.unwrap(),
            vec!["cpu"]
        );
        assert_eq!(
            store.describe_fields("telegraf", "cpu").await.unwrap(),
            vec![
                FieldInfo::new("state", FieldType::String),
                FieldInfo::new("usage", FieldType::Float),
            ]
        );
        assert!(matches!(
            store.list_measurements("missing").await,
            Err(DatastoreError::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = seeded();
        let drop = Statement::DropMeasurement {
            measurement: "cpu".to_string(),
        };

        store.fail_with_timeouts(2);
        for _ in 0..2 {
            let err = store.execute("telegraf", &drop).await.unwrap_err();
            assert!(err.is_transient());
        }

        store.fail_on(|statement| matches!(statement, Statement::DropMeasurement { .. }));
        let err = store.execute("telegraf", &drop).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(store.has_measurement("telegraf", "cpu"));

        store.clear_faults();
        store.execute("telegraf", &drop).await.unwrap();
        assert!(!store.has_measurement("telegraf", "cpu"));
    }

    #[test]
    fn test_bucket_alignment() {
        assert_eq!(bucket_start(at(10, 59), 3_600), at(10, 0));
        assert_eq!(bucket_start(at(10, 59), 1_800), at(10, 30));
        assert_eq!(
            bucket_start(DateTime::<Utc>::UNIX_EPOCH - TimeDelta::seconds(1), 60),
            DateTime::<Utc>::UNIX_EPOCH - TimeDelta::seconds(60)
        );
    }
}
