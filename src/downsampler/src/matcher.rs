//! Measurement matching
//!
//! Walks a database's catalog and keeps the measurements that have at least
//! one downsamplable field owned by a policy. Which policy owns a field when
//! several match is decided by [`PolicyPrecedence`].

use common::config::PolicyPrecedence;

use crate::datastore::{Datastore, FieldInfo, FieldType};
use crate::error::Result;
use crate::retry::RetryDriver;
use crate::schema::{AggregationFunction, CompiledSchema, Policy, RetentionWindow};

/// Appended to a measurement's name to form its staging measurement.
pub const TEMP_MEASUREMENT_SUFFIX: &str = "_downsample_temp";

const TEMP_MARKER: &str = "downsample_temp";

pub fn temp_measurement_name(measurement: &str) -> String {
    format!("{measurement}{TEMP_MEASUREMENT_SUFFIX}")
}

/// Leftover staging measurements are never processed themselves.
pub fn is_temp_measurement(measurement: &str) -> bool {
    measurement.contains(TEMP_MARKER)
}

/// A field selected for downsampling, with everything needed to plan it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedField {
    pub key: String,
    pub field_type: FieldType,
    pub retentions: Vec<RetentionWindow>,
    pub function: AggregationFunction,
    /// Schema position of the owning policy.
    pub policy_index: usize,
}

/// A measurement to downsample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementPlan {
    pub name: String,
    /// Downsampled fields, in datastore order.
    pub fields: Vec<MatchedField>,
    /// Every other field, copied through unchanged.
    pub passthrough: Vec<FieldInfo>,
}

/// Mean for floats, most recent value for integers.
fn default_function(field_type: &FieldType) -> AggregationFunction {
    match field_type {
        FieldType::Integer => AggregationFunction::Last,
        _ => AggregationFunction::Mean,
    }
}

/// Pick the owning policy among those matching a field.
fn owning_policy<'a>(
    precedence: PolicyPrecedence,
    mut candidates: impl DoubleEndedIterator<Item = &'a Policy>,
) -> Option<&'a Policy> {
    match precedence {
        PolicyPrecedence::FirstMatch => candidates.next(),
        PolicyPrecedence::LastMatch => candidates.next_back(),
    }
}

/// Split a measurement's fields into matched and passthrough.
///
/// `policies` must already accept the database and measurement. Returns
/// `None` when no field is matched.
pub fn match_fields(
    measurement: &str,
    policies: &[&Policy],
    precedence: PolicyPrecedence,
    fields: Vec<FieldInfo>,
) -> Option<MeasurementPlan> {
    let mut matched = Vec::new();
    let mut passthrough = Vec::new();

    for field in fields {
        let owner = if field.field_type.is_downsampled() {
            let candidates = policies
                .iter()
                .copied()
                .filter(|policy| policy.pattern.matches_field(&field.key));
            owning_policy(precedence, candidates)
        } else {
            None
        };

        match owner {
            Some(policy) => {
                tracing::debug!(
                    measurement,
                    field = %field.key,
                    policy = policy.index,
                    "Field matched"
                );
                matched.push(MatchedField {
                    retentions: policy.windows.clone(),
                    function: policy
                        .function
                        .clone()
                        .unwrap_or_else(|| default_function(&field.field_type)),
                    policy_index: policy.index,
                    key: field.key,
                    field_type: field.field_type,
                });
            }
            None => passthrough.push(field),
        }
    }

    if matched.is_empty() {
        return None;
    }

    Some(MeasurementPlan {
        name: measurement.to_string(),
        fields: matched,
        passthrough,
    })
}

/// Find every measurement of `database` with at least one matched field.
///
/// Field keys are only requested for measurements some policy could match.
pub async fn find_matching_measurements(
    schema: &CompiledSchema,
    database: &str,
    datastore: &dyn Datastore,
    retry: &RetryDriver,
) -> Result<Vec<MeasurementPlan>> {
    let measurements = retry
        .run("SHOW MEASUREMENTS", move || {
            datastore.list_measurements(database)
        })
        .await?;

    let mut plans = Vec::new();
    for measurement in measurements {
        if is_temp_measurement(&measurement) {
            tracing::debug!(database, measurement = %measurement, "Skipping staging measurement");
            continue;
        }

        let policies: Vec<&Policy> = schema.policies_for(database, &measurement).collect();
        if policies.is_empty() {
            continue;
        }

        let name = measurement.as_str();
        let fields = retry
            .run("SHOW FIELD KEYS", move || {
                datastore.describe_fields(database, name)
            })
            .await?;

        if let Some(plan) = match_fields(&measurement, &policies, schema.precedence, fields) {
            tracing::info!(
                database,
                measurement = %plan.name,
                matched = plan.fields.len(),
                passthrough = plan.passthrough.len(),
                "Measurement matched"
            );
            plans.push(plan);
        }
    }

    Ok(plans)
}
