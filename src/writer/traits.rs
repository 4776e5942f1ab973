use crate::batch::Batch;
use crate::delivery::DeliveryOutcome;
use crate::record::TopicPartition;
use async_trait::async_trait;

/// Downstream integration plugged into the delivery controller.
///
/// `attempt` must be safe to call repeatedly with the identical batch, and must never
/// report `Success` after applying only part of it. A writer that issues one call per
/// record reports the failed indices through `DeliveryOutcome::PartialFailure`.
///
/// Returning `Err` from `attempt` means the writer hit something it could not classify;
/// the controller treats it as fatal.
#[async_trait]
pub trait Writer: Send {
    /// Connect to the downstream system. Fails with `WriterError::Connection` when
    /// it is unreachable.
    async fn setup(&mut self) -> Result<(), WriterError>;

    async fn attempt(&mut self, batch: &Batch) -> Result<DeliveryOutcome, WriterError>;

    /// Best-effort resource release
    async fn close(&mut self) -> Result<(), WriterError> {
        Ok(())
    }

    fn name(&self) -> &str;
}

#[async_trait]
impl<W: Writer + ?Sized> Writer for Box<W> {
    async fn setup(&mut self) -> Result<(), WriterError> {
        (**self).setup().await
    }

    async fn attempt(&mut self, batch: &Batch) -> Result<DeliveryOutcome, WriterError> {
        (**self).attempt(batch).await
    }

    async fn close(&mut self) -> Result<(), WriterError> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Creates one writer per partition. Each writer is owned by a single partition worker.
pub trait WriterFactory: Send + Sync + 'static {
    type Writer: Writer + 'static;

    fn create(&self, topic_partition: &TopicPartition) -> Result<Self::Writer, WriterError>;
}

impl<F, W> WriterFactory for F
where
    F: Fn(&TopicPartition) -> Result<W, WriterError> + Send + Sync + 'static,
    W: Writer + 'static,
{
    type Writer = W;

    fn create(&self, topic_partition: &TopicPartition) -> Result<W, WriterError> {
        self(topic_partition)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("writer error: {0}")]
    Other(String),
}
