use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Least time a single per-record request should get within one attempt
const MIN_PER_RECORD_BUDGET: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a config document.
///
/// Environment variables are expanded before parsing, so credentials can stay out of
/// the file.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error.
/// Comment lines are ignored.
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded_vars: Vec<String> = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| re.captures_iter(line))
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Settings that are valid but likely to stall delivery.
///
/// Per-record HTTP posts every record of a batch in sequence inside one attempt, so
/// a large batch under a short `attempt_timeout` times out against a healthy server
/// and is redelivered until the backpressure ceiling turns it fatal.
pub fn config_warnings(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    if let WriterConfig::Http(http) = &config.writer {
        let batch_size = u32::try_from(config.sink.max_batch_size.max(1)).unwrap_or(u32::MAX);
        let per_record = config.sink.attempt_timeout / batch_size;
        if http.mode == HttpMode::PerRecord && per_record < MIN_PER_RECORD_BUDGET {
            warnings.push(format!(
                "writer.mode per_record sends up to {} requests per attempt, leaving {:?} each \
                 within sink.attempt_timeout ({:?}); lower sink.max_batch_size or raise \
                 sink.attempt_timeout so each request gets at least {:?}",
                config.sink.max_batch_size,
                per_record,
                config.sink.attempt_timeout,
                MIN_PER_RECORD_BUDGET
            ));
        }
    }

    warnings
}

/// Expands tilde (~) in all PathBuf fields in the config.
fn expand_paths(config: &mut Config) {
    if let Some(path) = &config.source.path {
        config.source.path = Some(expand_tilde(path));
    }

    if let WriterConfig::Duckdb(duckdb) = &mut config.writer {
        duckdb.path = expand_tilde(&duckdb.path);
    }

    config.checkpoint.path = expand_tilde(&config.checkpoint.path);
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_source(&config.source, &mut errors);
    validate_sink(&config.sink, &mut errors);
    validate_writer(&config.writer, &mut errors);

    if config.checkpoint.enabled && config.checkpoint.interval.is_zero() {
        errors.push("checkpoint.interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    if source.topic.trim().is_empty() {
        errors.push("source.topic cannot be empty".to_string());
    }

    if source.partitions == 0 {
        errors.push("source.partitions must be at least 1".to_string());
    }

    if let Some(key_field) = &source.key_field {
        if key_field.is_empty() {
            errors.push("source.key_field cannot be empty when set".to_string());
        }
    }
}

fn validate_sink(sink: &SinkConfig, errors: &mut Vec<String>) {
    if sink.max_batch_size == 0 {
        errors.push("sink.max_batch_size must be at least 1".to_string());
    }

    if sink.max_batch_delay.is_zero() {
        errors.push("sink.max_batch_delay must be greater than zero".to_string());
    }

    if sink.attempt_timeout.is_zero() {
        errors.push("sink.attempt_timeout must be greater than zero".to_string());
    }

    if sink.channel_capacity == 0 {
        errors.push("sink.channel_capacity must be at least 1".to_string());
    }

    let backoff = &sink.retry_backoff;
    if backoff.initial.is_zero() {
        errors.push("sink.retry_backoff.initial must be greater than zero".to_string());
    }
    if backoff.initial > backoff.max {
        errors.push(format!(
            "sink.retry_backoff.initial ({:?}) cannot exceed sink.retry_backoff.max ({:?})",
            backoff.initial, backoff.max
        ));
    }
    if !(backoff.multiplier >= 1.0 && backoff.multiplier.is_finite()) {
        errors.push(format!(
            "sink.retry_backoff.multiplier must be a finite number >= 1.0, got {}",
            backoff.multiplier
        ));
    }

    if sink.backpressure_ceiling.is_zero() {
        errors.push("sink.backpressure_ceiling must be greater than zero".to_string());
    }

    if sink.timeout_policy == TimeoutPolicy::Backpressure
        && sink.timeout_retry_after > sink.backpressure_ceiling
    {
        errors.push(format!(
            "sink.timeout_retry_after ({:?}) exceeds sink.backpressure_ceiling ({:?}); every timeout would be fatal",
            sink.timeout_retry_after, sink.backpressure_ceiling
        ));
    }
}

fn validate_writer(writer: &WriterConfig, errors: &mut Vec<String>) {
    match writer {
        WriterConfig::Http(http) => {
            if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                errors.push(format!(
                    "writer.url must start with http:// or https://, got '{}'",
                    http.url
                ));
            }
            if http.request_timeout.is_zero() {
                errors.push("writer.request_timeout must be greater than zero".to_string());
            }
            if http.key_field.is_some() && http.mode == HttpMode::Bulk {
                errors.push("writer.key_field is only supported in per_record mode".to_string());
            }
        }
        WriterConfig::Duckdb(duckdb) => {
            let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok();
            let is_identifier =
                |name: &str| identifier.as_ref().map(|re| re.is_match(name)).unwrap_or(false);

            if !is_identifier(&duckdb.table) {
                errors.push(format!(
                    "writer.table '{}' must be a plain SQL identifier",
                    duckdb.table
                ));
            }

            let reserved = ["topic", "partition", "offset", "record_key", "payload", "written_at"];
            let mut names = HashSet::new();
            for (i, column) in duckdb.columns.iter().enumerate() {
                if !is_identifier(&column.name) {
                    errors.push(format!(
                        "writer.columns[{}]: '{}' must be a plain SQL identifier",
                        i, column.name
                    ));
                }
                if reserved.contains(&column.name.to_lowercase().as_str()) {
                    errors.push(format!(
                        "writer.columns[{}]: '{}' is reserved for stream metadata",
                        i, column.name
                    ));
                }
                if !names.insert(column.name.to_lowercase()) {
                    errors.push(format!(
                        "writer.columns[{}]: duplicate column name '{}'",
                        i, column.name
                    ));
                }
            }
        }
        WriterConfig::Stdout => {}
    }
}
