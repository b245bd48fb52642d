use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use thiserror::Error;

/// Prefix for environment overrides, e.g. `DOWNSAMPLE__RETRY__BACKOFF=30s`.
pub const ENV_PREFIX: &str = "DOWNSAMPLE__";

/// Default schema file name used by the CLI.
pub const DEFAULT_SCHEMA_FILE: &str = "storage-schema.json";

/// Regular expressions selecting what a policy applies to.
///
/// Absent patterns match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// A single downsampling policy as written in the schema file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub pattern: PatternConfig,
    /// Comma separated `interval:min_age` tiers, most recent first, e.g. `"1h:1d,*:*"`.
    pub retentions: String,
    /// Aggregation template, `{}` is replaced with the field key, e.g. `MAX("{}")`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Which policy owns a field when more than one matches it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyPrecedence {
    /// The last matching policy in schema order wins.
    #[default]
    LastMatch,
    /// The first matching policy in schema order wins.
    FirstMatch,
}

/// Retry behaviour for transient datastore failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Fixed sleep between attempts.
    ///
    /// Env: DOWNSAMPLE__RETRY__BACKOFF
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff: Duration,

    /// Give up after this many attempts. Unbounded when absent.
    ///
    /// Env: DOWNSAMPLE__RETRY__MAX_ATTEMPTS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Give up once this much time has passed since the first attempt.
    ///
    /// Env: DOWNSAMPLE__RETRY__MAX_ELAPSED
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_elapsed: Option<Duration>,
}

fn default_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            max_attempts: None,
            max_elapsed: None,
        }
    }
}

/// Location of the per-measurement phase journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
}

fn default_checkpoint_enabled() -> bool {
    true
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".downsample-checkpoint.json")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_checkpoint_enabled(),
            path: default_checkpoint_path(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    /// Per-request HTTP timeout.
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Databases processed, in order.
    #[serde(default)]
    pub databases: Vec<String>,
    /// Policies in schema order.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub policy_precedence: PolicyPrecedence,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Log every statement without executing it.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8086,
            username: "root".to_string(),
            password: "root".to_string(),
            ssl: false,
            timeout: None,
            databases: Vec::new(),
            policies: Vec::new(),
            policy_precedence: PolicyPrecedence::default(),
            retry: RetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
            dry_run: false,
        }
    }
}

/// Connection settings supplied on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectionOverrides {
    /// Replace every connection setting that was given explicitly.
    pub fn apply(&self, config: &mut Configuration) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
    }
}

impl Configuration {
    /// Load a schema file, JSON or TOML by extension, layered over defaults and
    /// `DOWNSAMPLE__` environment variables.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let figment = Figment::from(Serialized::defaults(Configuration::default()));
        let figment = if is_json(path) {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        };

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Base URL of the InfluxDB HTTP API.
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Shallow checks that need no schema compilation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".to_string()));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        for (index, policy) in self.policies.iter().enumerate() {
            if policy.retentions.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "policy #{index} has no retentions"
                )));
            }
        }
        Ok(())
    }

    /// Copy suitable for printing, with the password masked.
    pub fn redacted(&self) -> Self {
        Self {
            password: "********".to_string(),
            ..self.clone()
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Schema file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to parse schema: {0}")]
    Load(Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
