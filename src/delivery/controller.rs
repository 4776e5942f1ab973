use crate::batch::Batch;
use crate::config::types::{PartialFailurePolicy, TimeoutPolicy};
use crate::delivery::outcome::{BackpressureSignal, DeliveryOutcome, FatalError, Verdict};
use crate::delivery::policy::DeliveryPolicy;
use crate::record::TopicPartition;
use crate::writer::Writer;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Where a partition sits in the delivery state machine.
///
/// `Idle -> Delivering -> { Idle (ack), Delivering (retry in place),
/// Paused (backpressure) -> Idle, Failed (terminal) }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPhase {
    Idle,
    Delivering,
    Paused { until: Instant },
    Failed,
}

/// Per-partition bookkeeping. Reset after every successful delivery.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub attempts_remaining: u32,
    pub last_backoff: Option<Duration>,
    /// Backpressure pause requested since the last success
    pub paused_total: Duration,
    pub phase: PartitionPhase,
}

impl ControllerState {
    fn new(attempt_ceiling: u32) -> Self {
        Self {
            attempts_remaining: attempt_ceiling,
            last_backoff: None,
            paused_total: Duration::ZERO,
            phase: PartitionPhase::Idle,
        }
    }

    fn reset(&mut self, attempt_ceiling: u32) {
        *self = Self::new(attempt_ceiling);
    }
}

/// Delivers batches through a writer and turns attempt outcomes into verdicts.
///
/// Transient failures are retried in place with backoff before `deliver` returns, so
/// the caller never sees a verdict for a batch that might still succeed locally.
/// Overload is handed back as `Verdict::RetryAfter` without local retries.
pub struct DeliveryController<W: Writer> {
    writer: W,
    policy: DeliveryPolicy,
    states: HashMap<TopicPartition, ControllerState>,
}

impl<W: Writer> DeliveryController<W> {
    pub fn new(writer: W, policy: DeliveryPolicy) -> Self {
        Self {
            writer,
            policy,
            states: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    pub fn state(&self, topic_partition: &TopicPartition) -> Option<&ControllerState> {
        self.states.get(topic_partition)
    }

    pub fn phase(&self, topic_partition: &TopicPartition) -> PartitionPhase {
        self.states
            .get(topic_partition)
            .map(|s| s.phase)
            .unwrap_or(PartitionPhase::Idle)
    }

    /// Mark a paused partition as ready for redelivery
    pub fn resume(&mut self, topic_partition: &TopicPartition) {
        if let Some(state) = self.states.get_mut(topic_partition) {
            if matches!(state.phase, PartitionPhase::Paused { .. }) {
                state.phase = PartitionPhase::Idle;
            }
        }
    }

    /// Operator intervention: clear a failed partition back to baseline
    pub fn reset(&mut self, topic_partition: &TopicPartition) {
        let ceiling = self.policy.attempt_ceiling();
        if let Some(state) = self.states.get_mut(topic_partition) {
            state.reset(ceiling);
        }
    }

    /// Forget a partition's state after it was revoked
    pub fn revoke(&mut self, topic_partition: &TopicPartition) -> Option<ControllerState> {
        self.states.remove(topic_partition)
    }

    /// Deliver one batch and decide its verdict
    pub async fn deliver(&mut self, batch: &Batch) -> Verdict {
        let Self {
            writer,
            policy,
            states,
        } = self;

        let tp = batch.topic_partition.clone();
        let ceiling = policy.attempt_ceiling();
        let state = states
            .entry(tp.clone())
            .or_insert_with(|| ControllerState::new(ceiling));

        if state.phase == PartitionPhase::Failed {
            return Verdict::Fatal(FatalError::for_batch(
                batch,
                "partition halted by an earlier fatal failure; reset required",
            ));
        }

        if batch.is_empty() {
            return Verdict::Ack;
        }

        state.phase = PartitionPhase::Delivering;

        // Original indices still to be written under split retry; None means the whole batch
        let mut pending: Option<Vec<usize>> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let split;
            let current = match &pending {
                Some(indices) => {
                    split = batch.select(indices);
                    &split
                }
                None => batch,
            };

            debug!(
                topic = %tp.topic,
                partition = tp.partition,
                batch_id = %batch.batch_id,
                records = current.len(),
                attempt = attempt,
                "Attempting batch delivery"
            );

            let outcome = attempt_once(writer, policy, current).await;

            let retry_reason = match outcome {
                DeliveryOutcome::Success => {
                    debug!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        batch_id = %batch.batch_id,
                        first_offset = ?batch.first_offset(),
                        last_offset = ?batch.last_offset(),
                        attempt = attempt,
                        "Batch delivered"
                    );
                    state.reset(ceiling);
                    return Verdict::Ack;
                }
                DeliveryOutcome::PartialFailure(indices) => {
                    let mut failed = indices;
                    failed.sort_unstable();
                    failed.dedup();

                    if failed.is_empty() || failed.iter().any(|i| *i >= current.len()) {
                        state.phase = PartitionPhase::Failed;
                        let err = FatalError::for_batch(
                            batch,
                            format!(
                                "writer reported invalid failure indices {:?} for {} records",
                                failed,
                                current.len()
                            ),
                        );
                        error!(error = %err, "Writer violated the partial failure contract");
                        return Verdict::Fatal(err);
                    }

                    let reason = format!("{} of {} records rejected", failed.len(), current.len());
                    if policy.partial_failure == PartialFailurePolicy::SplitRetry {
                        pending = Some(match &pending {
                            Some(previous) => failed.iter().map(|i| previous[*i]).collect(),
                            None => failed,
                        });
                    }
                    reason
                }
                DeliveryOutcome::Retryable(reason) => reason,
                DeliveryOutcome::Backpressure(retry_after) => {
                    let requested = state.paused_total + retry_after;
                    if requested > policy.backpressure_ceiling {
                        state.phase = PartitionPhase::Failed;
                        let err = FatalError::for_batch(
                            batch,
                            format!(
                                "backpressure ceiling of {}s exceeded ({}s paused, {}s more requested)",
                                policy.backpressure_ceiling.as_secs(),
                                state.paused_total.as_secs(),
                                retry_after.as_secs()
                            ),
                        );
                        error!(error = %err, "Downstream stayed overloaded past the pause ceiling");
                        return Verdict::Fatal(err);
                    }

                    state.paused_total = requested;
                    state.phase = PartitionPhase::Paused {
                        until: Instant::now() + retry_after,
                    };
                    warn!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        batch_id = %batch.batch_id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        paused_total_ms = requested.as_millis() as u64,
                        "Downstream signalled backpressure, pausing partition"
                    );
                    return Verdict::RetryAfter(BackpressureSignal {
                        topic_partition: tp,
                        retry_after,
                    });
                }
                DeliveryOutcome::Fatal(reason) => {
                    state.phase = PartitionPhase::Failed;
                    let err = FatalError::for_batch(batch, reason);
                    error!(error = %err, "Batch delivery failed fatally");
                    return Verdict::Fatal(err);
                }
            };

            state.attempts_remaining = state.attempts_remaining.saturating_sub(1);
            if state.attempts_remaining == 0 {
                state.phase = PartitionPhase::Failed;
                let err = FatalError::for_batch(
                    batch,
                    format!(
                        "delivery attempts exhausted after {} attempts: {}",
                        attempt, retry_reason
                    ),
                );
                error!(error = %err, "Giving up on batch");
                return Verdict::Fatal(err);
            }

            let backoff = policy.backoff.next(state.last_backoff);
            state.last_backoff = Some(backoff);
            warn!(
                topic = %tp.topic,
                partition = tp.partition,
                batch_id = %batch.batch_id,
                attempt = attempt,
                attempts_remaining = state.attempts_remaining,
                backoff_ms = backoff.as_millis() as u64,
                reason = %retry_reason,
                "Batch delivery failed, retrying in place"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Run one writer attempt under the attempt timeout, folding timeouts and
/// unexpected writer errors into outcomes
async fn attempt_once<W: Writer>(
    writer: &mut W,
    policy: &DeliveryPolicy,
    batch: &Batch,
) -> DeliveryOutcome {
    match tokio::time::timeout(policy.attempt_timeout, writer.attempt(batch)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => DeliveryOutcome::Fatal(format!("unexpected {} writer error: {}", writer.name(), e)),
        Err(_) => {
            let timeout_ms = policy.attempt_timeout.as_millis();
            match policy.timeout_policy {
                TimeoutPolicy::Backpressure => {
                    warn!(timeout_ms = timeout_ms as u64, "Writer attempt timed out, treating as overload");
                    DeliveryOutcome::Backpressure(policy.timeout_retry_after)
                }
                TimeoutPolicy::Retryable => {
                    DeliveryOutcome::Retryable(format!("attempt timed out after {}ms", timeout_ms))
                }
            }
        }
    }
}
