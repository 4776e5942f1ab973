pub mod reader;

pub use reader::{partition_for_key, JsonLinesReader, ReaderError};
