pub mod controller;
pub mod outcome;
pub mod policy;

pub use controller::{ControllerState, DeliveryController, PartitionPhase};
pub use outcome::{BackpressureSignal, DeliveryOutcome, FatalError, Verdict};
pub use policy::{Backoff, DeliveryPolicy};
