use crate::delivery::Verdict;
use crate::record::Record;
use tokio::sync::{mpsc, oneshot};

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

/// What the pipeline hands to a partition worker
#[derive(Debug)]
pub enum WorkerMessage {
    Record(Record),
    /// Deliver the open batch now; the reply carries its verdict, or `None` when
    /// nothing was pending
    Flush(oneshot::Sender<Option<Verdict>>),
}

/// Create a bounded channel with the specified buffer size. A full channel makes
/// `send` wait, which is how a paused partition slows its producer down.
pub fn create_channel<T>(buffer_size: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(buffer_size.max(1))
}
