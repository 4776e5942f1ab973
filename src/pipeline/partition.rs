use crate::batch::{Batch, BatchAccumulator, Offer};
use crate::checkpoint::CheckpointCoordinator;
use crate::delivery::{DeliveryController, FatalError, PartitionPhase, Verdict};
use crate::pipeline::channel::{Receiver, WorkerMessage};
use crate::record::TopicPartition;
use crate::writer::Writer;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest state a partition worker published
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub phase: PartitionPhase,
    pub fatal: Option<FatalError>,
}

/// Why a partition worker stopped
#[derive(Debug)]
pub enum WorkerExit {
    /// Input closed and every pending record was delivered
    Drained,
    /// Stopped by revoke or by the shutdown deadline; nothing further was acked
    Cancelled { discarded: usize },
    Failed(FatalError),
}

/// Owns one partition's accumulator, controller and writer.
///
/// Batches are delivered one at a time in stream order. While the controller
/// reports `RetryAfter` the worker sleeps and redelivers the same batch, and it
/// does not read its channel meanwhile.
pub(crate) struct PartitionWorker<W: Writer> {
    pub(crate) topic_partition: TopicPartition,
    pub(crate) accumulator: BatchAccumulator,
    pub(crate) controller: DeliveryController<W>,
    pub(crate) coordinator: Arc<dyn CheckpointCoordinator>,
    pub(crate) input: Receiver<WorkerMessage>,
    pub(crate) cancel: CancellationToken,
    pub(crate) status: watch::Sender<WorkerStatus>,
}

impl<W: Writer> PartitionWorker<W> {
    pub(crate) async fn run(mut self) -> WorkerExit {
        info!(
            topic = %self.topic_partition.topic,
            partition = self.topic_partition.partition,
            writer = self.controller.writer().name(),
            "Partition worker started"
        );

        let exit = self.run_loop().await;

        if let WorkerExit::Cancelled { .. } = exit {
            self.controller.revoke(&self.topic_partition);
        }

        if let Err(e) = self.controller.writer_mut().close().await {
            warn!(
                topic = %self.topic_partition.topic,
                partition = self.topic_partition.partition,
                error = %e,
                "Failed to close writer"
            );
        }

        match &exit {
            WorkerExit::Drained => info!(
                topic = %self.topic_partition.topic,
                partition = self.topic_partition.partition,
                "Partition worker drained"
            ),
            WorkerExit::Cancelled { discarded } => info!(
                topic = %self.topic_partition.topic,
                partition = self.topic_partition.partition,
                discarded = *discarded,
                "Partition worker cancelled"
            ),
            WorkerExit::Failed(_) => {}
        }
        exit
    }

    async fn run_loop(&mut self) -> WorkerExit {
        loop {
            let deadline = self.accumulator.deadline();

            let message = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return WorkerExit::Cancelled { discarded: self.accumulator.discard() };
                }

                message = self.input.recv() => message,

                _ = sleep_until_deadline(deadline) => {
                    if let Some(batch) = self.accumulator.poll_expired(Instant::now()) {
                        if let Err(exit) = self.deliver(batch).await {
                            return exit;
                        }
                    }
                    continue;
                }
            };

            match message {
                Some(WorkerMessage::Record(record)) => {
                    let offset = record.offset();
                    match self.accumulator.offer(record) {
                        Ok(Offer::BatchReady(batch)) => {
                            if let Err(exit) = self.deliver(batch).await {
                                return exit;
                            }
                        }
                        Ok(Offer::Pending) => {}
                        Err(e) => {
                            let fatal = FatalError {
                                topic_partition: self.topic_partition.clone(),
                                first_offset: Some(offset),
                                last_offset: Some(offset),
                                cause: e.to_string(),
                            };
                            self.coordinator.on_verdict(
                                &self.topic_partition,
                                offset,
                                &Verdict::Fatal(fatal.clone()),
                            );
                            return self.fail(fatal);
                        }
                    }
                }
                Some(WorkerMessage::Flush(reply)) => {
                    let result = match self.accumulator.flush() {
                        Some(batch) => self.deliver(batch).await.map(Some),
                        None => Ok(None),
                    };
                    match result {
                        Ok(verdict) => {
                            let _ = reply.send(verdict);
                        }
                        Err(exit) => {
                            if let WorkerExit::Failed(fatal) = &exit {
                                let _ = reply.send(Some(Verdict::Fatal(fatal.clone())));
                            }
                            return exit;
                        }
                    }
                }
                None => {
                    debug!(
                        topic = %self.topic_partition.topic,
                        partition = self.topic_partition.partition,
                        pending = self.accumulator.pending(),
                        "Input closed, flushing pending records"
                    );
                    if let Some(batch) = self.accumulator.flush() {
                        if let Err(exit) = self.deliver(batch).await {
                            return exit;
                        }
                    }
                    return WorkerExit::Drained;
                }
            }
        }
    }

    /// Deliver a batch until it is acked or fails, sleeping through backpressure pauses
    async fn deliver(&mut self, batch: Batch) -> Result<Verdict, WorkerExit> {
        loop {
            self.publish(PartitionPhase::Delivering);

            let verdict = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(WorkerExit::Cancelled {
                        discarded: batch.len() + self.accumulator.discard(),
                    });
                }
                verdict = self.controller.deliver(&batch) => verdict,
            };

            if let Some(up_to_offset) = batch.last_offset() {
                self.coordinator
                    .on_verdict(&self.topic_partition, up_to_offset, &verdict);
            }

            match verdict {
                Verdict::Ack => {
                    self.publish(self.controller.phase(&self.topic_partition));
                    return Ok(Verdict::Ack);
                }
                Verdict::RetryAfter(signal) => {
                    self.publish(self.controller.phase(&self.topic_partition));
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return Err(WorkerExit::Cancelled {
                                discarded: batch.len() + self.accumulator.discard(),
                            });
                        }
                        _ = tokio::time::sleep(signal.retry_after) => {}
                    }
                    self.controller.resume(&self.topic_partition);
                    debug!(
                        topic = %self.topic_partition.topic,
                        partition = self.topic_partition.partition,
                        batch_id = %batch.batch_id,
                        "Pause elapsed, redelivering batch"
                    );
                }
                Verdict::Fatal(fatal) => return Err(self.fail(fatal)),
            }
        }
    }

    fn fail(&mut self, fatal: FatalError) -> WorkerExit {
        self.status.send_replace(WorkerStatus {
            phase: PartitionPhase::Failed,
            fatal: Some(fatal.clone()),
        });
        WorkerExit::Failed(fatal)
    }

    fn publish(&self, phase: PartitionPhase) {
        self.status.send_modify(|status| status.phase = phase);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
