pub mod accumulator;
pub mod batch;

pub use accumulator::{AccumulatorError, BatchAccumulator, BatchTap, Offer};
pub use batch::Batch;
