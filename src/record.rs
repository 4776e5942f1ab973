use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A (topic, partition) pair. Checkpoints advance independently per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Where a record sits in its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl StreamPosition {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Raw bytes used for content hashing
    fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Bytes(bytes) => bytes.clone(),
        }
    }

    /// JSON view of the payload. Byte payloads become a lossy UTF-8 string.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Bytes(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }
}

/// A consumed stream record. Immutable once consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Option<String>,
    pub payload: Payload,
    pub position: StreamPosition,
}

impl Record {
    pub fn new(key: Option<String>, payload: Payload, position: StreamPosition) -> Self {
        Self {
            key,
            payload,
            position,
        }
    }

    pub fn offset(&self) -> u64 {
        self.position.offset
    }

    pub fn topic_partition(&self) -> TopicPartition {
        self.position.topic_partition()
    }

    /// Key a downstream system can deduplicate on.
    ///
    /// Uses the record key when present. Otherwise hashes the stream position and
    /// payload, which is stable across redeliveries of the same record.
    pub fn idempotency_key(&self) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.position.topic.as_bytes());
        hasher.update(self.position.partition.to_be_bytes());
        hasher.update(self.position.offset.to_be_bytes());
        hasher.update(self.payload.canonical_bytes());
        hex(&hasher.finalize())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_record(key: Option<&str>, offset: u64) -> Record {
        Record::new(
            key.map(|k| k.to_string()),
            Payload::Json(json!({"panel_id": "p-1", "power_output": 42})),
            StreamPosition {
                topic: "solar".to_string(),
                partition: 0,
                offset,
            },
        )
    }

    #[test]
    fn test_idempotency_key_prefers_record_key() {
        let record = make_record(Some("panel-7"), 3);
        assert_eq!(record.idempotency_key(), "panel-7");
    }

    #[test]
    fn test_idempotency_key_hash_is_stable() {
        let a = make_record(None, 3);
        let b = make_record(None, 3);
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_eq!(a.idempotency_key().len(), 64);
    }

    #[test]
    fn test_idempotency_key_hash_depends_on_offset() {
        let a = make_record(None, 3);
        let b = make_record(None, 4);
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(TopicPartition::new("solar", 2).to_string(), "solar[2]");
    }

    #[test]
    fn test_bytes_payload_to_json() {
        let payload = Payload::Bytes(b"not json".to_vec());
        assert_eq!(payload.to_json(), json!("not json"));
        assert!(payload.as_json().is_none());
    }
}
