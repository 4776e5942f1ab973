use crate::batch::Batch;
use crate::record::TopicPartition;
use std::fmt;
use std::time::Duration;

/// What a single `Writer::attempt` call reports. Exactly one per attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Every record in the batch was written
    Success,
    /// The records at these indices (relative to the attempted batch) were rejected;
    /// the rest were written
    PartialFailure(Vec<usize>),
    /// Transient failure, nothing acknowledged; safe to retry in place
    Retryable(String),
    /// Downstream is overloaded and asked for a pause of this length
    Backpressure(Duration),
    /// Unrecoverable: auth failure, schema violation, malformed record
    Fatal(String),
}

/// Request to pause consumption of one partition and redeliver the same batch later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureSignal {
    pub topic_partition: TopicPartition,
    pub retry_after: Duration,
}

impl BackpressureSignal {
    pub fn retry_after_seconds(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }
}

/// A terminal delivery failure with enough context for a manual replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub topic_partition: TopicPartition,
    pub first_offset: Option<u64>,
    pub last_offset: Option<u64>,
    pub cause: String,
}

impl FatalError {
    pub fn for_batch(batch: &Batch, cause: impl Into<String>) -> Self {
        Self {
            topic_partition: batch.topic_partition.clone(),
            first_offset: batch.first_offset(),
            last_offset: batch.last_offset(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.first_offset, self.last_offset) {
            (Some(first), Some(last)) => write!(
                f,
                "fatal delivery failure on {} (offsets {}..={}): {}",
                self.topic_partition, first, last, self.cause
            ),
            _ => write!(
                f,
                "fatal delivery failure on {}: {}",
                self.topic_partition, self.cause
            ),
        }
    }
}

impl std::error::Error for FatalError {}

/// The controller's answer for one batch, consumed by the checkpoint coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Durably written; the checkpoint may advance past the batch
    Ack,
    /// Pause the partition, then redeliver the identical batch
    RetryAfter(BackpressureSignal),
    /// Halt the partition until an operator intervenes
    Fatal(FatalError),
}

impl Verdict {
    pub fn is_ack(&self) -> bool {
        matches!(self, Verdict::Ack)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Ack => "ack",
            Verdict::RetryAfter(_) => "retry_after",
            Verdict::Fatal(_) => "fatal",
        }
    }
}
