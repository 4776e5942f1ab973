use crate::batch::accumulator::AccumulatorError;
use crate::record::{Record, TopicPartition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable, ordered group of records from a single partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Unique batch ID (for log correlation)
    pub batch_id: Uuid,

    /// Partition every record in this batch was consumed from
    pub topic_partition: TopicPartition,

    /// Records in stream order
    records: Vec<Record>,
}

impl Batch {
    /// Build a batch. Callers guarantee that all records belong to `topic_partition`
    /// and are in offset order; the accumulator enforces both.
    pub(crate) fn new(topic_partition: TopicPartition, records: Vec<Record>) -> Self {
        debug_assert!(records
            .iter()
            .all(|r| r.position.topic == topic_partition.topic
                && r.position.partition == topic_partition.partition));

        Self {
            batch_id: Uuid::new_v4(),
            topic_partition,
            records,
        }
    }

    /// Build a batch from records gathered elsewhere, checking the partition and
    /// ordering invariants the accumulator otherwise guarantees.
    pub fn try_new(
        topic_partition: TopicPartition,
        records: Vec<Record>,
    ) -> Result<Self, AccumulatorError> {
        let mut previous: Option<u64> = None;
        for record in &records {
            let got = record.topic_partition();
            if got != topic_partition {
                return Err(AccumulatorError::PartitionMismatch {
                    expected: topic_partition,
                    got,
                });
            }
            if let Some(previous) = previous {
                if record.offset() <= previous {
                    return Err(AccumulatorError::OffsetRegression {
                        topic_partition,
                        previous,
                        offset: record.offset(),
                    });
                }
            }
            previous = Some(record.offset());
        }

        Ok(Self::new(topic_partition, records))
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.records.first().map(|r| r.offset())
    }

    /// Highest offset in the batch; the checkpoint may advance past it on Ack
    pub fn last_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.offset())
    }

    /// Sub-batch holding only the records at `indices`, in their original order.
    /// Indices that are out of range are ignored.
    pub fn select(&self, indices: &[usize]) -> Batch {
        let mut sorted: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|i| *i < self.records.len())
            .collect();
        sorted.sort_unstable();
        sorted.dedup();

        Batch {
            batch_id: Uuid::new_v4(),
            topic_partition: self.topic_partition.clone(),
            records: sorted.into_iter().map(|i| self.records[i].clone()).collect(),
        }
    }
}
