use super::traits::{Writer, WriterError};
use crate::batch::Batch;
use crate::config::types::{HttpMode, HttpWriterConfig};
use crate::delivery::DeliveryOutcome;
use crate::record::Record;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use std::time::Duration;

/// How one HTTP exchange should count towards the batch outcome
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExchangeResult {
    Written,
    Retry(String),
    Overloaded(Duration),
    Rejected(String),
}

/// Posts records to an HTTP endpoint.
///
/// In per-record mode every record is its own request, and records that hit a
/// transient failure are reported by index so the controller can retry them.
/// Every request carries an `Idempotency-Key` header.
pub struct HttpWriter {
    config: HttpWriterConfig,
    base_url: Url,
    client: Option<reqwest::Client>,
}

impl HttpWriter {
    pub fn new(config: HttpWriterConfig) -> Result<Self, WriterError> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| WriterError::Other(format!("invalid url '{}': {}", config.url, e)))?;

        Ok(Self {
            config,
            base_url,
            client: None,
        })
    }

    fn client(&self) -> Result<&reqwest::Client, WriterError> {
        self.client
            .as_ref()
            .ok_or_else(|| WriterError::Connection("http writer used before setup".to_string()))
    }

    fn default_headers(&self) -> Result<HeaderMap, WriterError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WriterError::Other(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WriterError::Other(format!("invalid header value for '{}': {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Target URL for one record: the base URL, plus the key field's value as an
    /// extra path segment when configured and present
    fn record_url(&self, record: &Record) -> Url {
        let key_value = self.config.key_field.as_ref().and_then(|field| {
            record.payload.as_json().and_then(|payload| match payload.get(field) {
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(serde_json::Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
        });

        let mut url = self.base_url.clone();
        if let Some(value) = key_value {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(&value);
            }
        }
        url
    }

    async fn post(&self, url: Url, body: serde_json::Value, idempotency_key: &str) -> ExchangeResult {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => return ExchangeResult::Rejected(e.to_string()),
        };

        let response = client
            .post(url)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                if status.is_success() {
                    return ExchangeResult::Written;
                }
                let body = response.text().await.unwrap_or_default();
                classify_status(status, retry_after, self.config.backpressure_retry_after, &body)
            }
            Err(e) => classify_error(&e, self.config.backpressure_retry_after),
        }
    }

    async fn attempt_per_record(&self, batch: &Batch) -> DeliveryOutcome {
        let mut failed = Vec::new();
        let mut last_reason = String::new();

        for (index, record) in batch.records().iter().enumerate() {
            let url = self.record_url(record);
            match self
                .post(url, record.payload.to_json(), &record.idempotency_key())
                .await
            {
                ExchangeResult::Written => {}
                ExchangeResult::Retry(reason) => {
                    tracing::debug!(
                        offset = record.offset(),
                        reason = %reason,
                        "Record delivery failed transiently"
                    );
                    failed.push(index);
                    last_reason = reason;
                }
                // Stop sending: the rest of the batch would only add load
                ExchangeResult::Overloaded(retry_after) => {
                    return DeliveryOutcome::Backpressure(retry_after);
                }
                ExchangeResult::Rejected(reason) => {
                    return DeliveryOutcome::Fatal(format!(
                        "record at offset {} rejected: {}",
                        record.offset(),
                        reason
                    ));
                }
            }
        }

        if failed.is_empty() {
            DeliveryOutcome::Success
        } else if failed.len() == batch.len() {
            DeliveryOutcome::Retryable(last_reason)
        } else {
            DeliveryOutcome::PartialFailure(failed)
        }
    }

    async fn attempt_bulk(&self, batch: &Batch) -> DeliveryOutcome {
        let body = serde_json::Value::Array(
            batch.records().iter().map(|r| r.payload.to_json()).collect(),
        );
        let key = format!(
            "{}-{}-{}",
            batch.topic_partition,
            batch.first_offset().unwrap_or_default(),
            batch.last_offset().unwrap_or_default()
        );

        match self.post(self.base_url.clone(), body, &key).await {
            ExchangeResult::Written => DeliveryOutcome::Success,
            ExchangeResult::Retry(reason) => DeliveryOutcome::Retryable(reason),
            ExchangeResult::Overloaded(retry_after) => DeliveryOutcome::Backpressure(retry_after),
            ExchangeResult::Rejected(reason) => DeliveryOutcome::Fatal(reason),
        }
    }
}

#[async_trait]
impl Writer for HttpWriter {
    async fn setup(&mut self) -> Result<(), WriterError> {
        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .default_headers(self.default_headers()?)
            .build()?;

        // Any response proves the endpoint is reachable; only transport errors fail setup
        match client.head(self.base_url.clone()).send().await {
            Ok(response) => {
                tracing::info!(
                    url = %self.base_url,
                    status = response.status().as_u16(),
                    "HTTP writer connected"
                );
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(WriterError::Connection(format!(
                    "cannot reach {}: {}",
                    self.base_url, e
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.client = Some(client);
        Ok(())
    }

    async fn attempt(&mut self, batch: &Batch) -> Result<DeliveryOutcome, WriterError> {
        self.client()?;
        Ok(match self.config.mode {
            HttpMode::PerRecord => self.attempt_per_record(batch).await,
            HttpMode::Bulk => self.attempt_bulk(batch).await,
        })
    }

    async fn close(&mut self) -> Result<(), WriterError> {
        self.client = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Seconds form of the Retry-After header. HTTP-date values are not supported and
/// fall back to the configured pause.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    default_pause: Duration,
    body: &str,
) -> ExchangeResult {
    let detail = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>())
    };

    match status {
        s if s.is_success() => ExchangeResult::Written,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            ExchangeResult::Overloaded(retry_after.unwrap_or(default_pause))
        }
        StatusCode::REQUEST_TIMEOUT => ExchangeResult::Retry(detail),
        s if s.is_server_error() => ExchangeResult::Retry(detail),
        _ => ExchangeResult::Rejected(detail),
    }
}

fn classify_error(error: &reqwest::Error, default_pause: Duration) -> ExchangeResult {
    if error.is_timeout() {
        ExchangeResult::Overloaded(default_pause)
    } else if error.is_builder() {
        ExchangeResult::Rejected(error.to_string())
    } else {
        ExchangeResult::Retry(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Payload, StreamPosition};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn make_config(url: &str, key_field: Option<&str>) -> HttpWriterConfig {
        HttpWriterConfig {
            url: url.to_string(),
            mode: HttpMode::PerRecord,
            key_field: key_field.map(|s| s.to_string()),
            headers: BTreeMap::new(),
            request_timeout: Duration::from_secs(10),
            backpressure_retry_after: Duration::from_secs(30),
        }
    }

    fn make_record(payload: serde_json::Value) -> Record {
        Record::new(
            None,
            Payload::Json(payload),
            StreamPosition {
                topic: "solar".to_string(),
                partition: 0,
                offset: 0,
            },
        )
    }

    #[test]
    fn test_classify_overload_uses_retry_after() {
        let result = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            Duration::from_secs(30),
            "",
        );
        assert_eq!(result, ExchangeResult::Overloaded(Duration::from_secs(7)));

        let result = classify_status(StatusCode::SERVICE_UNAVAILABLE, None, Duration::from_secs(30), "");
        assert_eq!(result, ExchangeResult::Overloaded(Duration::from_secs(30)));
    }

    #[test]
    fn test_classify_server_errors_are_retryable() {
        let result = classify_status(StatusCode::BAD_GATEWAY, None, Duration::from_secs(30), "upstream");
        assert_eq!(result, ExchangeResult::Retry("HTTP 502: upstream".to_string()));
    }

    #[test]
    fn test_classify_client_errors_are_rejected() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::UNPROCESSABLE_ENTITY] {
            let result = classify_status(status, None, Duration::from_secs(30), "");
            assert!(matches!(result, ExchangeResult::Rejected(_)), "{} should be rejected", status);
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_record_url_appends_key() {
        let writer = HttpWriter::new(make_config("http://localhost:9000/data/", Some("location_id"))).unwrap();

        let url = writer.record_url(&make_record(json!({"location_id": "loc 1"})));
        assert_eq!(url.as_str(), "http://localhost:9000/data/loc%201");

        let url = writer.record_url(&make_record(json!({"other": 1})));
        assert_eq!(url.as_str(), "http://localhost:9000/data/");
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(HttpWriter::new(make_config("not a url", None)).is_err());
    }
}
