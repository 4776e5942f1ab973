use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    pub writer: WriterConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON-lines file to consume. Reads stdin when omitted.
    pub path: Option<PathBuf>,
    pub topic: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Payload field used as the record key (and for partitioning)
    pub key_field: Option<String>,
    /// Decode `{"value": "<json string>"}` envelopes
    #[serde(default)]
    pub unwrap_envelope: bool,
}

fn default_partitions() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub max_batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub max_batch_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: RetryBackoffConfig,
    pub timeout_policy: TimeoutPolicy,
    #[serde(with = "humantime_serde")]
    pub timeout_retry_after: Duration,
    #[serde(with = "humantime_serde")]
    pub backpressure_ceiling: Duration,
    pub partial_failure: PartialFailurePolicy,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub channel_capacity: usize,
    pub debug_tap: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_batch_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: RetryBackoffConfig::default(),
            timeout_policy: TimeoutPolicy::Backpressure,
            timeout_retry_after: Duration::from_secs(30),
            backpressure_ceiling: Duration::from_secs(600),
            partial_failure: PartialFailurePolicy::RetryWhole,
            shutdown_grace: Duration::from_secs(15),
            channel_capacity: 1000,
            debug_tap: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Backpressure,
    Retryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Retry the whole batch; records already written are rewritten
    RetryWhole,
    /// Retry only the rejected records
    SplitRetry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriterConfig {
    Http(HttpWriterConfig),
    Duckdb(DuckDbWriterConfig),
    Stdout,
}

impl WriterConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            WriterConfig::Http(_) => "http",
            WriterConfig::Duckdb(_) => "duckdb",
            WriterConfig::Stdout => "stdout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpWriterConfig {
    pub url: String,
    #[serde(default)]
    pub mode: HttpMode,
    /// Payload field appended to the URL path in per-record mode
    pub key_field: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Pause requested when the server signals overload without a Retry-After header
    #[serde(default = "default_backpressure_retry_after", with = "humantime_serde")]
    pub backpressure_retry_after: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backpressure_retry_after() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMode {
    #[default]
    PerRecord,
    Bulk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuckDbWriterConfig {
    pub path: PathBuf,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    /// Payload field to read; defaults to the column name
    pub field: Option<String>,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
}

impl ColumnConfig {
    pub fn field(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Double,
    Bigint,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "VARCHAR",
            ColumnType::Double => "DOUBLE",
            ColumnType::Bigint => "BIGINT",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("sinkflow-offsets.json"),
            interval: Duration::from_secs(30),
        }
    }
}
