pub mod batch;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod writer;
