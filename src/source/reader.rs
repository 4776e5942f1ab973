use crate::config::types::SourceConfig;
use crate::record::{Payload, Record, StreamPosition, TopicPartition};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open source '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

type LineSource = Box<dyn AsyncBufRead + Send + Unpin>;

/// Turns a JSON-lines stream into partitioned records.
///
/// Partition assignment and offsets depend only on the input, so reading the same
/// file again reproduces the same stream positions.
pub struct JsonLinesReader {
    input: LineSource,
    line: Vec<u8>,
    topic: String,
    partitions: u32,
    key_field: Option<String>,
    unwrap_envelope: bool,
    next_offsets: Vec<u64>,
    round_robin: u32,
    skip_through: BTreeMap<TopicPartition, u64>,
    skipped: u64,
}

impl JsonLinesReader {
    /// Open the configured file, or stdin when no path is set
    pub async fn open(config: &SourceConfig) -> Result<Self, ReaderError> {
        match &config.path {
            Some(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|source| ReaderError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
                tracing::info!("Reading records from {}", path.display());
                Ok(Self::from_reader(file, config))
            }
            None => {
                tracing::info!("Reading records from stdin");
                Ok(Self::from_reader(tokio::io::stdin(), config))
            }
        }
    }

    pub fn from_reader<R>(reader: R, config: &SourceConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let partitions = config.partitions.max(1);

        Self {
            input: Box::new(BufReader::new(reader)),
            line: Vec::new(),
            topic: config.topic.clone(),
            partitions,
            key_field: config.key_field.clone(),
            unwrap_envelope: config.unwrap_envelope,
            next_offsets: vec![0; partitions as usize],
            round_robin: 0,
            skip_through: BTreeMap::new(),
            skipped: 0,
        }
    }

    /// Skip records at or below these offsets; they were already committed
    pub fn skip_committed(mut self, committed: BTreeMap<TopicPartition, u64>) -> Self {
        self.skip_through = committed;
        self
    }

    /// Partition count records are spread over
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Number of records skipped because they were already committed
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next record not yet committed. Lines that are not UTF-8 or not JSON are
    /// delivered as raw bytes.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    pub async fn next_record(&mut self) -> Result<Option<Record>, ReaderError> {
        loop {
            let read = self.input.read_until(b'\n', &mut self.line).await?;
            if read == 0 && self.line.is_empty() {
                return Ok(None);
            }

            let payload = match trim_line(&self.line) {
                [] => None,
                line => Some(decode_line(line, self.unwrap_envelope)),
            };
            self.line.clear();
            let payload = match payload {
                Some(payload) => payload,
                None => continue,
            };

            let record = self.make_record(payload);
            let committed = self.skip_through.get(&record.topic_partition());
            if committed.map_or(false, |&committed| record.offset() <= committed) {
                self.skipped += 1;
                continue;
            }
            return Ok(Some(record));
        }
    }

    fn make_record(&mut self, payload: Payload) -> Record {
        let key = self
            .key_field
            .as_deref()
            .and_then(|field| extract_key(&payload, field));

        let partition = match &key {
            Some(key) => partition_for_key(key, self.partitions),
            None => {
                let partition = self.round_robin;
                self.round_robin = (self.round_robin + 1) % self.partitions;
                partition
            }
        };

        let offset = self.next_offsets[partition as usize];
        self.next_offsets[partition as usize] += 1;

        Record::new(
            key,
            payload,
            StreamPosition {
                topic: self.topic.clone(),
                partition,
                offset,
            },
        )
    }
}

/// Stable partition for a key: SHA-256 of the key, modulo the partition count
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

fn decode_line(line: &[u8], unwrap_envelope: bool) -> Payload {
    match std::str::from_utf8(line) {
        Ok(text) => decode_payload(text, unwrap_envelope),
        Err(_) => Payload::Bytes(line.to_vec()),
    }
}

fn decode_payload(line: &str, unwrap_envelope: bool) -> Payload {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return Payload::Bytes(line.as_bytes().to_vec()),
    };

    if unwrap_envelope {
        match value.get("value") {
            Some(serde_json::Value::String(inner)) => {
                if let Ok(inner) = serde_json::from_str(inner) {
                    return Payload::Json(inner);
                }
            }
            Some(inner @ serde_json::Value::Object(_)) => return Payload::Json(inner.clone()),
            _ => {}
        }
    }

    Payload::Json(value)
}

fn extract_key(payload: &Payload, field: &str) -> Option<String> {
    match payload.as_json()?.get(field)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
