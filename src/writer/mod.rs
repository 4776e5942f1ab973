pub mod duckdb;
pub mod http;
pub mod stdout;
pub mod traits;

pub use self::duckdb::{DuckDbWriter, DuckDbWriterFactory};
pub use self::http::HttpWriter;
pub use self::stdout::StdoutWriter;
pub use self::traits::{Writer, WriterError, WriterFactory};

use crate::config::types::{HttpWriterConfig, WriterConfig};
use crate::record::TopicPartition;

/// Builds the writer named in the config for each partition.
pub enum ConfiguredWriterFactory {
    Http(HttpWriterConfig),
    Duckdb(DuckDbWriterFactory),
    Stdout,
}

impl ConfiguredWriterFactory {
    pub fn from_config(config: &WriterConfig) -> Result<Self, WriterError> {
        Ok(match config {
            WriterConfig::Http(http) => {
                // Surface a bad URL before any partition starts
                HttpWriter::new(http.clone())?;
                ConfiguredWriterFactory::Http(http.clone())
            }
            WriterConfig::Duckdb(duckdb) => {
                ConfiguredWriterFactory::Duckdb(DuckDbWriterFactory::open(duckdb.clone())?)
            }
            WriterConfig::Stdout => ConfiguredWriterFactory::Stdout,
        })
    }
}

impl WriterFactory for ConfiguredWriterFactory {
    type Writer = Box<dyn Writer>;

    fn create(&self, topic_partition: &TopicPartition) -> Result<Box<dyn Writer>, WriterError> {
        Ok(match self {
            ConfiguredWriterFactory::Http(config) => Box::new(HttpWriter::new(config.clone())?),
            ConfiguredWriterFactory::Duckdb(factory) => Box::new(factory.create(topic_partition)?),
            ConfiguredWriterFactory::Stdout => Box::new(StdoutWriter::new()),
        })
    }
}
