use crate::batch::batch::Batch;
use crate::record::{Record, TopicPartition};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Observer invoked with every batch the accumulator emits
pub type BatchTap = Arc<dyn Fn(&Batch) + Send + Sync>;

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("record from {got} offered to accumulator for {expected}")]
    PartitionMismatch {
        expected: TopicPartition,
        got: TopicPartition,
    },

    #[error("offset regression on {topic_partition}: {offset} offered after {previous}")]
    OffsetRegression {
        topic_partition: TopicPartition,
        previous: u64,
        offset: u64,
    },
}

/// Result of offering a record
#[derive(Debug)]
pub enum Offer {
    /// A batch crossed its count or age threshold and must be delivered
    BatchReady(Batch),
    /// The record was buffered into the open batch
    Pending,
}

impl Offer {
    pub fn into_batch(self) -> Option<Batch> {
        match self {
            Offer::BatchReady(batch) => Some(batch),
            Offer::Pending => None,
        }
    }
}

/// Collects one partition's records into bounded batches.
///
/// A batch is emitted once it holds `max_batch_size` records, or once
/// `max_batch_delay` has passed since its first record was accepted.
pub struct BatchAccumulator {
    topic_partition: TopicPartition,
    max_batch_size: usize,
    max_batch_delay: Duration,
    buffer: Vec<Record>,
    opened_at: Option<Instant>,
    last_offset: Option<u64>,
    tap: Option<BatchTap>,
}

impl BatchAccumulator {
    pub fn new(topic_partition: TopicPartition, max_batch_size: usize, max_batch_delay: Duration) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            topic_partition,
            max_batch_size,
            max_batch_delay,
            buffer: Vec::with_capacity(max_batch_size),
            opened_at: None,
            last_offset: None,
            tap: None,
        }
    }

    pub fn with_tap(mut self, tap: BatchTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Number of records in the open batch
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Instant at which the open batch ages out, if one is open
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_batch_delay)
    }

    pub fn offer(&mut self, record: Record) -> Result<Offer, AccumulatorError> {
        self.offer_at(record, Instant::now())
    }

    /// Offer a record observed at `now`.
    ///
    /// If the open batch already aged out before this record arrived, the aged batch
    /// is emitted on its own and the record opens the next batch.
    pub fn offer_at(&mut self, record: Record, now: Instant) -> Result<Offer, AccumulatorError> {
        let got = record.topic_partition();
        if got != self.topic_partition {
            return Err(AccumulatorError::PartitionMismatch {
                expected: self.topic_partition.clone(),
                got,
            });
        }

        if let Some(previous) = self.last_offset {
            if record.offset() <= previous {
                return Err(AccumulatorError::OffsetRegression {
                    topic_partition: self.topic_partition.clone(),
                    previous,
                    offset: record.offset(),
                });
            }
        }
        self.last_offset = Some(record.offset());

        if let Some(aged) = self.poll_expired(now) {
            self.open_with(record, now);
            return Ok(Offer::BatchReady(aged));
        }

        if self.buffer.is_empty() {
            self.open_with(record, now);
        } else {
            self.buffer.push(record);
        }

        if self.buffer.len() >= self.max_batch_size {
            return Ok(Offer::BatchReady(self.emit()));
        }

        Ok(Offer::Pending)
    }

    /// Emit the open batch if its age has passed `max_batch_delay` at `now`
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline && !self.buffer.is_empty() => Some(self.emit()),
            _ => None,
        }
    }

    /// Emit whatever is buffered, regardless of thresholds
    pub fn flush(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.emit())
        }
    }

    /// Drop the open batch without emitting it. Returns how many records were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.opened_at = None;
        dropped
    }

    fn open_with(&mut self, record: Record, now: Instant) {
        self.opened_at = Some(now);
        self.buffer.push(record);
    }

    fn emit(&mut self) -> Batch {
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_batch_size));
        self.opened_at = None;

        let batch = Batch::new(self.topic_partition.clone(), records);
        if let Some(tap) = &self.tap {
            tap(&batch);
        }
        batch
    }
}
