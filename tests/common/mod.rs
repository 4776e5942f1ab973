#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use sinkflow::batch::Batch;
use sinkflow::checkpoint::CheckpointCoordinator;
use sinkflow::delivery::{DeliveryOutcome, Verdict};
use sinkflow::record::{Payload, Record, StreamPosition, TopicPartition};
use sinkflow::writer::{Writer, WriterError, WriterFactory};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const TOPIC: &str = "solar";

pub fn tp(partition: u32) -> TopicPartition {
    TopicPartition::new(TOPIC, partition)
}

pub fn record(partition: u32, offset: u64) -> Record {
    Record::new(
        Some(format!("panel-{}-{}", partition, offset)),
        Payload::Json(json!({"panel_id": format!("p{}", offset), "power_output": offset})),
        StreamPosition {
            topic: TOPIC.to_string(),
            partition,
            offset,
        },
    )
}

pub fn batch(partition: u32, offsets: std::ops::Range<u64>) -> Batch {
    Batch::try_new(tp(partition), offsets.map(|o| record(partition, o)).collect()).unwrap()
}

/// What a scripted writer does on one attempt
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    /// Write everything except these indices and report them failed
    Reject(Vec<usize>),
    Retry,
    Backpressure(Duration),
    Fatal(String),
    /// Never complete, so the attempt timeout fires
    Hang,
    /// Return an unclassified writer error
    Error,
}

/// Idempotent downstream keyed by stream position. Counts every physical write.
#[derive(Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<BTreeMap<(u32, u64), serde_json::Value>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemorySink {
    fn write(&self, record: &Record) {
        self.rows
            .lock()
            .unwrap()
            .insert((record.position.partition, record.offset()), record.payload.to_json());
        *self.writes.lock().unwrap() += 1;
    }

    pub fn offsets(&self, partition: u32) -> Vec<u64> {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| *o)
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn physical_writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

/// One observed attempt: the offsets it carried and when it started
#[derive(Debug, Clone)]
pub struct AttemptLog {
    pub partition: u32,
    pub offsets: Vec<u64>,
    pub at: Instant,
}

/// Plays back a per-partition script, then succeeds once the script runs out.
/// Scripts are shared with the factory so a recreated writer continues them.
pub struct ScriptedWriter {
    partition: u32,
    script: Arc<Mutex<VecDeque<Step>>>,
    sink: MemorySink,
    attempts: Arc<Mutex<Vec<AttemptLog>>>,
}

impl ScriptedWriter {
    pub fn new(steps: Vec<Step>, sink: MemorySink) -> Self {
        Self {
            partition: 0,
            script: Arc::new(Mutex::new(steps.into())),
            sink,
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempts(&self) -> Arc<Mutex<Vec<AttemptLog>>> {
        self.attempts.clone()
    }
}

#[async_trait]
impl Writer for ScriptedWriter {
    async fn setup(&mut self) -> Result<(), WriterError> {
        Ok(())
    }

    async fn attempt(&mut self, batch: &Batch) -> Result<DeliveryOutcome, WriterError> {
        self.attempts.lock().unwrap().push(AttemptLog {
            partition: self.partition,
            offsets: batch.records().iter().map(|r| r.offset()).collect(),
            at: Instant::now(),
        });

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {
                batch.records().iter().for_each(|r| self.sink.write(r));
                Ok(DeliveryOutcome::Success)
            }
            Step::Reject(indices) => {
                for (i, record) in batch.records().iter().enumerate() {
                    if !indices.contains(&i) {
                        self.sink.write(record);
                    }
                }
                Ok(DeliveryOutcome::PartialFailure(indices))
            }
            Step::Retry => Ok(DeliveryOutcome::Retryable("connection reset".to_string())),
            Step::Backpressure(retry_after) => Ok(DeliveryOutcome::Backpressure(retry_after)),
            Step::Fatal(reason) => Ok(DeliveryOutcome::Fatal(reason)),
            Step::Hang => std::future::pending().await,
            Step::Error => Err(WriterError::Other("driver crashed".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Creates scripted writers, one script per partition, all writing to one sink
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<u32, Arc<Mutex<VecDeque<Step>>>>>>,
    pub sink: MemorySink,
    pub attempts: Arc<Mutex<Vec<AttemptLog>>>,
}

impl ScriptedFactory {
    pub fn with_script(self, partition: u32, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(partition, Arc::new(Mutex::new(steps.into())));
        self
    }

    pub fn attempts_for(&self, partition: u32) -> Vec<AttemptLog> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.partition == partition)
            .cloned()
            .collect()
    }
}

impl WriterFactory for ScriptedFactory {
    type Writer = ScriptedWriter;

    fn create(&self, topic_partition: &TopicPartition) -> Result<ScriptedWriter, WriterError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .entry(topic_partition.partition)
            .or_default()
            .clone();
        Ok(ScriptedWriter {
            partition: topic_partition.partition,
            script,
            sink: self.sink.clone(),
            attempts: self.attempts.clone(),
        })
    }
}

/// Remembers every verdict it was told about
#[derive(Default)]
pub struct RecordingCoordinator {
    verdicts: Mutex<Vec<(TopicPartition, u64, Verdict)>>,
}

impl RecordingCoordinator {
    pub fn verdicts(&self) -> Vec<(TopicPartition, u64, Verdict)> {
        self.verdicts.lock().unwrap().clone()
    }

    pub fn acked(&self, partition: u32) -> Vec<u64> {
        self.verdicts()
            .into_iter()
            .filter(|(t, _, v)| t.partition == partition && v.is_ack())
            .map(|(_, offset, _)| offset)
            .collect()
    }

    pub fn fatal_count(&self) -> usize {
        self.verdicts()
            .iter()
            .filter(|(_, _, v)| matches!(v, Verdict::Fatal(_)))
            .count()
    }
}

impl CheckpointCoordinator for RecordingCoordinator {
    fn on_verdict(&self, topic_partition: &TopicPartition, up_to_offset: u64, verdict: &Verdict) {
        self.verdicts
            .lock()
            .unwrap()
            .push((topic_partition.clone(), up_to_offset, verdict.clone()));
    }
}

/// Poll until `condition` holds. Under paused time the sleeps advance the clock.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
