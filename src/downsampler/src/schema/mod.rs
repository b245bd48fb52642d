//! Schema compilation: turns the declarative configuration into policies
//! with compiled patterns and absolute retention windows.
//!
//! ## Usage
//!
//! ```no_run
//! use common::Configuration;
//! use downsampler::schema::CompiledSchema;
//!
//! let config = Configuration::load_from_path("storage-schema.json".as_ref())?;
//! let schema = CompiledSchema::compile(&config)?;
//! for policy in &schema.policies {
//!     println!("{}: {} windows", policy.index, policy.windows.len());
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod error;
pub mod offset;
pub mod retention;

use common::config::{
    Configuration, PatternConfig, PolicyConfig, PolicyPrecedence, RetryConfig,
};
use regex::Regex;
use std::fmt;

pub use error::SchemaError;
pub use offset::{Offset, OffsetUnit, ReferenceTime, convert_offset, format_timestamp};
pub use retention::{RetentionTier, RetentionWindow, build_windows, parse_retentions};

const MATCH_ALL: &str = ".*";

/// Database, measurement and field patterns of one policy.
///
/// Patterns are anchored at the start of the name only, so `cpu` matches
/// `cpu` and `cpu_total` alike.
#[derive(Debug, Clone)]
pub struct PolicyPattern {
    database: Regex,
    measurement: Regex,
    field: Regex,
}

impl PolicyPattern {
    fn compile(policy: usize, config: &PatternConfig) -> Result<Self, SchemaError> {
        let compile = |target: &'static str, pattern: &Option<String>| {
            let pattern = pattern.as_deref().unwrap_or(MATCH_ALL);
            Regex::new(&format!("^(?:{pattern})")).map_err(|source| SchemaError::InvalidPattern {
                policy,
                target,
                pattern: pattern.to_string(),
                source,
            })
        };

        Ok(Self {
            database: compile("database", &config.database)?,
            measurement: compile("measurement", &config.measurement)?,
            field: compile("field", &config.field)?,
        })
    }

    /// Whether the policy applies to a measurement of a database.
    pub fn matches_measurement(&self, database: &str, measurement: &str) -> bool {
        self.database.is_match(database) && self.measurement.is_match(measurement)
    }

    pub fn matches_field(&self, field_key: &str) -> bool {
        self.field.is_match(field_key)
    }
}

/// How a bucketed window aggregates a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationFunction {
    /// `MEAN("<field>")`, the default for float fields.
    Mean,
    /// `LAST("<field>")`, the default for integer fields.
    Last,
    /// A user template where `{}` stands for the field key.
    Template(String),
}

impl AggregationFunction {
    pub fn from_template(template: &str) -> Result<Self, SchemaError> {
        if !template.contains("{}") {
            return Err(SchemaError::InvalidFunction {
                template: template.to_string(),
            });
        }
        Ok(AggregationFunction::Template(template.to_string()))
    }

    /// Render the selection expression for `field_key`.
    pub fn render(&self, field_key: &str) -> String {
        match self {
            AggregationFunction::Mean => format!("MEAN({})", quote_identifier(field_key)),
            AggregationFunction::Last => format!("LAST({})", quote_identifier(field_key)),
            AggregationFunction::Template(template) => {
                template.replace("{}", &escape_identifier(field_key))
            }
        }
    }

    /// Upper-cased name of the outermost function call, e.g. `MAX`.
    pub fn name(&self) -> String {
        match self {
            AggregationFunction::Mean => "MEAN".to_string(),
            AggregationFunction::Last => "LAST".to_string(),
            AggregationFunction::Template(template) => template
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationFunction::Mean => write!(f, "MEAN(\"{{}}\")"),
            AggregationFunction::Last => write!(f, "LAST(\"{{}}\")"),
            AggregationFunction::Template(template) => write!(f, "{template}"),
        }
    }
}

/// Escape an identifier for use between double quotes.
pub fn escape_identifier(identifier: &str) -> String {
    identifier.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Double-quote an identifier, e.g. `"cpu load"`.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", escape_identifier(identifier))
}

/// A compiled policy. Immutable once built.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Position in schema order.
    pub index: usize,
    pub pattern: PolicyPattern,
    pub tiers: Vec<RetentionTier>,
    pub windows: Vec<RetentionWindow>,
    /// Explicit aggregation, `None` falls back to the per-type default.
    pub function: Option<AggregationFunction>,
}

impl Policy {
    pub fn compile(
        index: usize,
        config: &PolicyConfig,
        reference: &ReferenceTime,
    ) -> Result<Self, SchemaError> {
        let pattern = PolicyPattern::compile(index, &config.pattern)?;
        let tiers = parse_retentions(&config.retentions)?;
        let windows = build_windows(reference, &tiers)?;
        let function = config
            .function
            .as_deref()
            .map(AggregationFunction::from_template)
            .transpose()?;

        Ok(Self {
            index,
            pattern,
            tiers,
            windows,
            function,
        })
    }
}

/// Output of the schema compiler.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub databases: Vec<String>,
    pub policies: Vec<Policy>,
    pub precedence: PolicyPrecedence,
    pub retry: RetryConfig,
    pub reference_time: ReferenceTime,
}

impl CompiledSchema {
    /// Compile against a reference time captured now.
    pub fn compile(config: &Configuration) -> Result<Self, SchemaError> {
        Self::compile_at(config, ReferenceTime::now())
    }

    /// Compile every policy against the same reference time.
    pub fn compile_at(
        config: &Configuration,
        reference_time: ReferenceTime,
    ) -> Result<Self, SchemaError> {
        let policies = config
            .policies
            .iter()
            .enumerate()
            .map(|(index, policy)| Policy::compile(index, policy, &reference_time))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            policies = policies.len(),
            databases = config.databases.len(),
            reference_time = %reference_time,
            "Schema compiled"
        );

        Ok(Self {
            databases: config.databases.clone(),
            policies,
            precedence: config.policy_precedence,
            retry: config.retry.clone(),
            reference_time,
        })
    }

    /// Policies whose database and measurement patterns accept the pair.
    pub fn policies_for<'a>(
        &'a self,
        database: &'a str,
        measurement: &'a str,
    ) -> impl Iterator<Item = &'a Policy> + 'a {
        self.policies
            .iter()
            .filter(move |policy| policy.pattern.matches_measurement(database, measurement))
    }
}
