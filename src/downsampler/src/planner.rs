//! Query plan generation
//!
//! Turns a matched measurement into typed statements: one aggregation per
//! (field, retention window), one verbatim copy per field no policy owns, and
//! the fixed drop/restore/drop sequence around them. Statements render as
//! InfluxQL through `Display`.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::datastore::FieldInfo;
use crate::matcher::{MatchedField, MeasurementPlan, temp_measurement_name};
use crate::schema::{AggregationFunction, RetentionWindow, format_timestamp, quote_identifier};

/// What a `SELECT ... INTO` projects for its field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The raw field value.
    Raw,
    /// The field aggregated per time bucket.
    Aggregate(AggregationFunction),
}

/// Time bounds of a statement, `min` inclusive and `max` exclusive; absent
/// bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.min.is_none_or(|min| timestamp >= min) && self.max.is_none_or(|max| timestamp < max)
    }
}

impl From<&RetentionWindow> for TimeRange {
    fn from(window: &RetentionWindow) -> Self {
        Self {
            min: window.min_timestamp,
            max: window.max_timestamp,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (None, None) => Ok(()),
            (Some(min), None) => write!(f, "WHERE time >= '{}'", format_timestamp(&min)),
            (None, Some(max)) => write!(f, "WHERE time < '{}'", format_timestamp(&max)),
            (Some(min), Some(max)) => write!(
                f,
                "WHERE time >= '{}' AND time < '{}'",
                format_timestamp(&min),
                format_timestamp(&max)
            ),
        }
    }
}

/// `SELECT <selection> AS "<field>" INTO "<target>" FROM "<source>" ... GROUP BY ... *`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectInto {
    pub source: String,
    pub target: String,
    pub field_key: String,
    pub selection: Selection,
    pub time_range: TimeRange,
    /// Bucket width for `GROUP BY time(...)`; all tags are always preserved.
    pub interval: Option<Duration>,
}

/// A statement the executor submits to the datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    DropMeasurement { measurement: String },
    SelectInto(SelectInto),
    /// Wildcard copy of every field and tag from `source` into `target`.
    CopyAll { source: String, target: String },
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::DropMeasurement { measurement } => {
                write!(f, "DROP MEASUREMENT {}", quote_identifier(measurement))
            }
            Statement::SelectInto(select) => {
                let field = quote_identifier(&select.field_key);
                let expression = match &select.selection {
                    Selection::Raw => field.clone(),
                    Selection::Aggregate(function) => function.render(&select.field_key),
                };
                write!(
                    f,
                    "SELECT {expression} AS {field} INTO {} FROM {}",
                    quote_identifier(&select.target),
                    quote_identifier(&select.source)
                )?;
                if !select.time_range.is_unbounded() {
                    write!(f, " {}", select.time_range)?;
                }
                match select.interval {
                    Some(interval) => write!(f, " GROUP BY time({}), *", format_interval(interval)),
                    None => write!(f, " GROUP BY *"),
                }
            }
            Statement::CopyAll { source, target } => write!(
                f,
                "SELECT * INTO {} FROM {} GROUP BY *",
                quote_identifier(target),
                quote_identifier(source)
            ),
        }
    }
}

/// Render a bucket width in the largest whole InfluxQL unit.
pub fn format_interval(interval: Duration) -> String {
    const UNITS: [(u64, &str); 4] = [(604_800, "w"), (86_400, "d"), (3_600, "h"), (60, "m")];

    let secs = interval.as_secs();
    if secs == 0 || interval.subsec_nanos() != 0 {
        return format!("{}ms", interval.as_millis());
    }
    UNITS
        .iter()
        .find(|(unit, _)| secs % unit == 0)
        .map(|(unit, suffix)| format!("{}{suffix}", secs / unit))
        .unwrap_or_else(|| format!("{secs}s"))
}

/// One aggregation of one field over one retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationStep {
    pub field_key: String,
    pub window_index: usize,
    pub interval: Option<Duration>,
    pub statement: Statement,
}

/// Verbatim copy of a field no policy owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughStep {
    pub field: FieldInfo,
    pub statement: Statement,
}

/// Ordered statements that downsample one measurement in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementQueryPlan {
    pub measurement: String,
    pub temp_measurement: String,
    pub aggregations: Vec<AggregationStep>,
    pub passthrough: Vec<PassthroughStep>,
}

impl MeasurementQueryPlan {
    pub fn drop_temp(&self) -> Statement {
        Statement::DropMeasurement {
            measurement: self.temp_measurement.clone(),
        }
    }

    pub fn drop_original(&self) -> Statement {
        Statement::DropMeasurement {
            measurement: self.measurement.clone(),
        }
    }

    pub fn restore(&self) -> Statement {
        Statement::CopyAll {
            source: self.temp_measurement.clone(),
            target: self.measurement.clone(),
        }
    }

    /// The whole sequence in execution order.
    pub fn statements(&self) -> Vec<Statement> {
        let mut statements = vec![self.drop_temp()];
        statements.extend(self.aggregations.iter().map(|step| step.statement.clone()));
        statements.extend(self.passthrough.iter().map(|step| step.statement.clone()));
        statements.push(self.drop_original());
        statements.push(self.restore());
        statements.push(self.drop_temp());
        statements
    }
}

/// Aggregation steps for one field, in tier order.
///
/// A field without retention windows yields no steps.
pub fn plan_field(
    measurement: &str,
    temp_measurement: &str,
    field: &MatchedField,
) -> Vec<AggregationStep> {
    field
        .retentions
        .iter()
        .enumerate()
        .map(|(window_index, window)| {
            let selection = if window.is_bucketed() {
                Selection::Aggregate(field.function.clone())
            } else {
                Selection::Raw
            };

            AggregationStep {
                field_key: field.key.clone(),
                window_index,
                interval: window.interval,
                statement: Statement::SelectInto(SelectInto {
                    source: measurement.to_string(),
                    target: temp_measurement.to_string(),
                    field_key: field.key.clone(),
                    selection,
                    time_range: TimeRange::from(window),
                    interval: window.interval,
                }),
            }
        })
        .collect()
}

/// Build the full statement plan of a matched measurement.
pub fn plan_measurement(plan: &MeasurementPlan) -> MeasurementQueryPlan {
    let temp_measurement = temp_measurement_name(&plan.name);

    let aggregations = plan
        .fields
        .iter()
        .flat_map(|field| plan_field(&plan.name, &temp_measurement, field))
        .collect();

    let passthrough = plan
        .passthrough
        .iter()
        .map(|field| PassthroughStep {
            field: field.clone(),
            statement: Statement::SelectInto(SelectInto {
                source: plan.name.clone(),
                target: temp_measurement.clone(),
                field_key: field.key.clone(),
                selection: Selection::Raw,
                time_range: TimeRange::default(),
                interval: None,
            }),
        })
        .collect();

    MeasurementQueryPlan {
        measurement: plan.name.clone(),
        temp_measurement,
        aggregations,
        passthrough,
    }
}
