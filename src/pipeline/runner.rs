use crate::batch::{Batch, BatchAccumulator, BatchTap};
use crate::checkpoint::CheckpointCoordinator;
use crate::config::types::SinkConfig;
use crate::delivery::{DeliveryController, DeliveryPolicy, FatalError, PartitionPhase, Verdict};
use crate::pipeline::channel::{create_channel, Sender, WorkerMessage};
use crate::pipeline::partition::{PartitionWorker, WorkerExit, WorkerStatus};
use crate::record::{Record, TopicPartition};
use crate::writer::{Writer, WriterError, WriterFactory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long cancelled workers get to close their writers before they are aborted
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Errors that can occur during pipeline operation
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to set up writer for {topic_partition}: {source}")]
    WriterSetup {
        topic_partition: TopicPartition,
        #[source]
        source: WriterError,
    },

    #[error(transparent)]
    PartitionFailed(FatalError),

    #[error("partition {0} is no longer accepting records")]
    PartitionClosed(TopicPartition),
}

/// How each partition ended on shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Every pushed record was resolved
    pub drained: Vec<TopicPartition>,
    /// Cut off by the grace period; pending and in-flight records were not acked
    pub abandoned: Vec<TopicPartition>,
    pub failed: Vec<FatalError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && self.failed.is_empty()
    }
}

struct WorkerHandle {
    sender: Sender<WorkerMessage>,
    status: watch::Receiver<WorkerStatus>,
    cancel: CancellationToken,
    join: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    fn fatal(&self) -> Option<FatalError> {
        self.status.borrow().fatal.clone()
    }
}

/// Routes records to one worker task per partition.
///
/// A worker (with its own writer) is started the first time a partition is seen.
/// Partitions deliver independently: a partition paused by backpressure only
/// blocks pushes to that partition once its channel fills up.
pub struct SinkPipeline<F: WriterFactory> {
    config: SinkConfig,
    policy: DeliveryPolicy,
    factory: F,
    coordinator: Arc<dyn CheckpointCoordinator>,
    workers: HashMap<TopicPartition, WorkerHandle>,
    shutdown: CancellationToken,
}

impl<F: WriterFactory> SinkPipeline<F> {
    pub fn new(config: SinkConfig, factory: F, coordinator: Arc<dyn CheckpointCoordinator>) -> Self {
        let policy = DeliveryPolicy::from(&config);
        Self {
            config,
            policy,
            factory,
            coordinator,
            workers: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.workers.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Current phase of a partition, if it has a worker
    pub fn phase(&self, topic_partition: &TopicPartition) -> Option<PartitionPhase> {
        self.workers
            .get(topic_partition)
            .map(|handle| handle.status.borrow().phase)
    }

    /// Hand a record to its partition's worker.
    ///
    /// Waits while the partition's channel is full. Fails once the partition has
    /// halted on a fatal error.
    pub async fn push(&mut self, record: Record) -> Result<(), PipelineError> {
        let topic_partition = record.topic_partition();
        if !self.workers.contains_key(&topic_partition) {
            self.spawn_worker(&topic_partition).await?;
        }

        let handle = self
            .workers
            .get(&topic_partition)
            .ok_or_else(|| PipelineError::PartitionClosed(topic_partition.clone()))?;

        if let Some(fatal) = handle.fatal() {
            return Err(PipelineError::PartitionFailed(fatal));
        }

        if handle.sender.send(WorkerMessage::Record(record)).await.is_err() {
            return Err(match handle.fatal() {
                Some(fatal) => PipelineError::PartitionFailed(fatal),
                None => PipelineError::PartitionClosed(topic_partition),
            });
        }
        Ok(())
    }

    /// Deliver a partition's open batch now and wait for its verdict
    pub async fn flush_partition(
        &self,
        topic_partition: &TopicPartition,
    ) -> Result<Option<Verdict>, PipelineError> {
        let handle = match self.workers.get(topic_partition) {
            Some(handle) => handle,
            None => return Ok(None),
        };

        let (reply, response) = oneshot::channel();
        let closed = || match handle.fatal() {
            Some(fatal) => PipelineError::PartitionFailed(fatal),
            None => PipelineError::PartitionClosed(topic_partition.clone()),
        };

        handle
            .sender
            .send(WorkerMessage::Flush(reply))
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())
    }

    /// Stop a partition without flushing.
    ///
    /// Its pending records are discarded unacknowledged, so the consumer sees them
    /// again from the last committed offset. Returns how many buffered or in-flight
    /// records were dropped, or `None` if the partition had no worker.
    pub async fn revoke(&mut self, topic_partition: &TopicPartition) -> Option<usize> {
        let handle = self.workers.remove(topic_partition)?;
        handle.cancel.cancel();
        drop(handle.sender);

        let discarded = match handle.join.await {
            Ok(WorkerExit::Cancelled { discarded }) => discarded,
            Ok(_) => 0,
            Err(e) => {
                warn!(topic_partition = %topic_partition, error = %e, "Partition worker panicked");
                0
            }
        };

        info!(
            topic = %topic_partition.topic,
            partition = topic_partition.partition,
            discarded = discarded,
            "Partition revoked"
        );
        Some(discarded)
    }

    /// Clear a partition halted by a fatal error so the next push starts it afresh.
    /// Returns false if the partition was not failed.
    pub async fn reset(&mut self, topic_partition: &TopicPartition) -> bool {
        let failed = self
            .workers
            .get(topic_partition)
            .map_or(false, |handle| handle.fatal().is_some());
        if !failed {
            return false;
        }

        if let Some(handle) = self.workers.remove(topic_partition) {
            drop(handle.sender);
            let _ = handle.join.await;
        }
        info!(
            topic = %topic_partition.topic,
            partition = topic_partition.partition,
            "Failed partition reset"
        );
        true
    }

    /// Close every partition's input and let workers deliver what they hold.
    ///
    /// Workers still busy after `grace` are cancelled; their batches are never acked.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        info!(
            partitions = self.workers.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down sink pipeline"
        );

        let mut abort_handles = Vec::new();
        let mut joins = Vec::new();
        for (topic_partition, handle) in self.workers.drain() {
            drop(handle.sender);
            abort_handles.push(handle.join.abort_handle());
            joins.push(async move { (topic_partition, handle.join.await) });
        }

        let all = futures::future::join_all(joins);
        tokio::pin!(all);

        let results = match tokio::time::timeout(grace, &mut all).await {
            Ok(results) => results,
            Err(_) => {
                warn!("Shutdown grace period elapsed, abandoning in-flight deliveries");
                self.shutdown.cancel();
                match tokio::time::timeout(CANCEL_GRACE, &mut all).await {
                    Ok(results) => results,
                    Err(_) => {
                        for handle in &abort_handles {
                            handle.abort();
                        }
                        all.await
                    }
                }
            }
        };

        let mut report = ShutdownReport::default();
        for (topic_partition, result) in results {
            match result {
                Ok(WorkerExit::Drained) => report.drained.push(topic_partition),
                Ok(WorkerExit::Cancelled { .. }) => report.abandoned.push(topic_partition),
                Ok(WorkerExit::Failed(fatal)) => report.failed.push(fatal),
                Err(e) => {
                    warn!(topic_partition = %topic_partition, error = %e, "Partition worker did not finish");
                    report.abandoned.push(topic_partition);
                }
            }
        }
        report.drained.sort();
        report.abandoned.sort();

        info!(
            drained = report.drained.len(),
            abandoned = report.abandoned.len(),
            failed = report.failed.len(),
            "Sink pipeline shutdown complete"
        );
        report
    }

    async fn spawn_worker(&mut self, topic_partition: &TopicPartition) -> Result<(), PipelineError> {
        let setup_error = |source| PipelineError::WriterSetup {
            topic_partition: topic_partition.clone(),
            source,
        };

        let mut writer = self.factory.create(topic_partition).map_err(setup_error)?;
        writer.setup().await.map_err(setup_error)?;

        let mut accumulator = BatchAccumulator::new(
            topic_partition.clone(),
            self.config.max_batch_size,
            self.config.max_batch_delay,
        );
        if self.config.debug_tap {
            accumulator = accumulator.with_tap(debug_tap());
        }

        let (sender, input) = create_channel(self.config.channel_capacity);
        let (status, status_rx) = watch::channel(WorkerStatus {
            phase: PartitionPhase::Idle,
            fatal: None,
        });
        let cancel = self.shutdown.child_token();

        let worker = PartitionWorker {
            topic_partition: topic_partition.clone(),
            accumulator,
            controller: DeliveryController::new(writer, self.policy.clone()),
            coordinator: self.coordinator.clone(),
            input,
            cancel: cancel.clone(),
            status,
        };
        let join = tokio::spawn(worker.run());

        debug!(
            topic = %topic_partition.topic,
            partition = topic_partition.partition,
            "Spawned partition worker"
        );
        self.workers.insert(
            topic_partition.clone(),
            WorkerHandle {
                sender,
                status: status_rx,
                cancel,
                join,
            },
        );
        Ok(())
    }
}

/// Logs every emitted batch with its records
fn debug_tap() -> BatchTap {
    Arc::new(|batch: &Batch| {
        debug!(
            topic = %batch.topic_partition.topic,
            partition = batch.topic_partition.partition,
            batch_id = %batch.batch_id,
            first_offset = ?batch.first_offset(),
            last_offset = ?batch.last_offset(),
            records = batch.len(),
            "Batch emitted"
        );
        for record in batch.records() {
            debug!(
                offset = record.offset(),
                key = ?record.key,
                payload = %record.payload.to_json(),
                "Batch record"
            );
        }
    })
}
