pub mod store;

pub use store::{Checkpoint, CheckpointError, CheckpointManager, PartitionOffset};

use crate::delivery::{FatalError, Verdict};
use crate::record::TopicPartition;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Receives the delivery verdict for every resolved batch.
///
/// Only an `Ack` allows the committed position to move past `up_to_offset`.
pub trait CheckpointCoordinator: Send + Sync {
    fn on_verdict(&self, topic_partition: &TopicPartition, up_to_offset: u64, verdict: &Verdict);
}

/// Tracks committed offsets per partition. Acks advance a partition monotonically;
/// fatals are kept so the caller can report them.
#[derive(Debug)]
pub struct OffsetTracker {
    committed: Mutex<BTreeMap<TopicPartition, u64>>,
    fatals: Mutex<Vec<FatalError>>,
    fatal_count: watch::Sender<usize>,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::with_committed(BTreeMap::new())
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously persisted offsets
    pub fn with_committed(committed: BTreeMap<TopicPartition, u64>) -> Self {
        Self {
            committed: Mutex::new(committed),
            fatals: Mutex::new(Vec::new()),
            fatal_count: watch::channel(0).0,
        }
    }

    /// Resolves once any partition has reported a fatal verdict
    pub async fn fatal_reported(&self) {
        let mut count = self.fatal_count.subscribe();
        let _ = count.wait_for(|count| *count > 0).await;
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<u64> {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic_partition)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<TopicPartition, u64> {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn fatals(&self) -> Vec<FatalError> {
        self.fatals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Snapshot for persisting; `partition_count` is the source layout the offsets
    /// belong to
    pub fn checkpoint(&self, partition_count: u32) -> Checkpoint {
        Checkpoint::from_offsets(&self.snapshot(), partition_count)
    }
}

impl CheckpointCoordinator for OffsetTracker {
    fn on_verdict(&self, topic_partition: &TopicPartition, up_to_offset: u64, verdict: &Verdict) {
        match verdict {
            Verdict::Ack => {
                let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
                let entry = committed.entry(topic_partition.clone()).or_insert(up_to_offset);
                if up_to_offset < *entry {
                    tracing::warn!(
                        topic = %topic_partition.topic,
                        partition = topic_partition.partition,
                        committed = *entry,
                        offset = up_to_offset,
                        "Ignoring ack behind committed offset"
                    );
                } else {
                    *entry = up_to_offset;
                }
            }
            Verdict::RetryAfter(signal) => {
                tracing::info!(
                    topic = %topic_partition.topic,
                    partition = topic_partition.partition,
                    retry_after_s = signal.retry_after_seconds(),
                    "Partition paused by downstream backpressure"
                );
            }
            Verdict::Fatal(fatal) => {
                let mut fatals = self.fatals.lock().unwrap_or_else(|e| e.into_inner());
                fatals.push(fatal.clone());
                self.fatal_count.send_replace(fatals.len());
            }
        }
    }
}
