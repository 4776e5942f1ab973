use super::traits::{Writer, WriterError};
use crate::batch::Batch;
use crate::delivery::DeliveryOutcome;
use async_trait::async_trait;
use serde_json::json;
use std::io::Write;

/// Prints each record as one JSON line. Mostly useful for trying out a config.
pub struct StdoutWriter<W: Write + Send = std::io::Stdout> {
    out: W,
}

impl StdoutWriter {
    pub fn new() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl Default for StdoutWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StdoutWriter<W> {
    pub fn with_output(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> Writer for StdoutWriter<W> {
    async fn setup(&mut self) -> Result<(), WriterError> {
        Ok(())
    }

    async fn attempt(&mut self, batch: &Batch) -> Result<DeliveryOutcome, WriterError> {
        // Render the whole batch first so a serialization problem writes nothing
        let mut buffer = Vec::new();
        for record in batch.records() {
            let line = json!({
                "topic": record.position.topic,
                "partition": record.position.partition,
                "offset": record.position.offset,
                "key": record.key,
                "payload": record.payload.to_json(),
            });
            serde_json::to_writer(&mut buffer, &line)?;
            buffer.push(b'\n');
        }

        let written = self.out.write_all(&buffer).and_then(|_| self.out.flush());
        Ok(match written {
            Ok(()) => DeliveryOutcome::Success,
            Err(e) => DeliveryOutcome::Retryable(format!("stdout write failed: {}", e)),
        })
    }

    async fn close(&mut self) -> Result<(), WriterError> {
        self.out.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Payload, Record, StreamPosition, TopicPartition};

    #[tokio::test]
    async fn test_writes_one_line_per_record() {
        let records = (0..2)
            .map(|offset| {
                Record::new(
                    None,
                    if offset == 0 {
                        Payload::Json(json!({"panel_id": "p0"}))
                    } else {
                        Payload::Bytes(b"raw line".to_vec())
                    },
                    StreamPosition {
                        topic: "solar".to_string(),
                        partition: 1,
                        offset,
                    },
                )
            })
            .collect();
        let batch = Batch::try_new(TopicPartition::new("solar", 1), records).unwrap();

        let mut writer = StdoutWriter::with_output(Vec::new());
        assert_eq!(writer.attempt(&batch).await.unwrap(), DeliveryOutcome::Success);

        let output = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"]["panel_id"], "p0");
        assert_eq!(lines[1]["offset"], 1);
        assert_eq!(lines[1]["payload"], "raw line");
    }
}
