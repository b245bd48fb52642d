//! InfluxDB 1.x HTTP client.
//!
//! Every statement is sent as `POST /query` with `q` and `db` form fields.
//! Errors InfluxDB reports inside a 200 response are surfaced the same way
//! as non-2xx replies, and any error mentioning a timeout is transient.

use async_trait::async_trait;
use common::Configuration;
use serde::Deserialize;
use std::time::Duration;

use super::{Datastore, DatastoreError, FieldInfo, FieldType, QueryOutcome, is_timeout_message};
use crate::planner::Statement;
use crate::schema::quote_identifier;

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<SeriesResult>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SeriesResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl SeriesResult {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

fn classify(message: String) -> DatastoreError {
    if is_timeout_message(&message) {
        DatastoreError::Timeout(message)
    } else {
        DatastoreError::Query(message)
    }
}

/// HTTP client for one InfluxDB server
#[derive(Debug, Clone)]
pub struct InfluxClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl InfluxClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, DatastoreError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http: builder.build()?,
        })
    }

    pub fn from_config(config: &Configuration) -> Result<Self, DatastoreError> {
        Self::new(
            &config.base_url(),
            &config.username,
            &config.password,
            config.timeout,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run one InfluxQL statement and return its single result.
    async fn query(&self, database: &str, q: &str) -> Result<StatementResult, DatastoreError> {
        let url = format!("{}/query", self.base_url);
        let mut request = self.http.post(&url).form(&[("q", q), ("db", database)]);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        tracing::trace!(database, query = q, "Submitting query");
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<QueryResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| body.clone());
            if is_timeout_message(&message) {
                return Err(DatastoreError::Timeout(message));
            }
            return Err(DatastoreError::Http {
                status: status.as_u16(),
                body: message,
            });
        }

        let response: QueryResponse = serde_json::from_str(&body)?;
        if let Some(error) = response.error {
            return Err(classify(error));
        }
        let result = response.results.into_iter().next().unwrap_or_default();
        if let Some(error) = result.error {
            return Err(classify(error));
        }
        Ok(result)
    }
}

#[async_trait]
impl Datastore for InfluxClient {
    async fn list_measurements(&self, database: &str) -> Result<Vec<String>, DatastoreError> {
        let result = self.query(database, "SHOW MEASUREMENTS").await?;

        let mut names = Vec::new();
        for series in &result.series {
            let column = series.column("name").unwrap_or(0);
            names.extend(
                series
                    .values
                    .iter()
                    .filter_map(|row| row.get(column)?.as_str().map(str::to_string)),
            );
        }
        Ok(names)
    }

    async fn describe_fields(
        &self,
        database: &str,
        measurement: &str,
    ) -> Result<Vec<FieldInfo>, DatastoreError> {
        let q = format!("SHOW FIELD KEYS FROM {}", quote_identifier(measurement));
        let result = self.query(database, &q).await?;

        let mut fields = Vec::new();
        for series in &result.series {
            let key_column = series.column("fieldKey").unwrap_or(0);
            let type_column = series.column("fieldType").unwrap_or(1);
            for row in &series.values {
                let Some(key) = row.get(key_column).and_then(|v| v.as_str()) else {
                    continue;
                };
                let field_type = row
                    .get(type_column)
                    .and_then(|v| v.as_str())
                    .map(FieldType::parse)
                    .unwrap_or_else(|| FieldType::Other(String::new()));
                fields.push(FieldInfo::new(key, field_type));
            }
        }
        Ok(fields)
    }

    async fn execute(
        &self,
        database: &str,
        statement: &Statement,
    ) -> Result<QueryOutcome, DatastoreError> {
        let result = self.query(database, &statement.to_string()).await?;

        let written = result
            .series
            .iter()
            .filter_map(|series| {
                let column = series.column("written")?;
                Some(
                    series
                        .values
                        .iter()
                        .filter_map(|row| row.get(column)?.as_u64())
                        .sum::<u64>(),
                )
            })
            .sum();
        Ok(QueryOutcome { written })
    }
}
