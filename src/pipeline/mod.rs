pub mod channel;
pub mod partition;
pub mod runner;

pub use channel::{create_channel, Receiver, Sender, WorkerMessage};
pub use partition::{WorkerExit, WorkerStatus};
pub use runner::{PipelineError, ShutdownReport, SinkPipeline};
