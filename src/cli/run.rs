use crate::checkpoint::{CheckpointError, CheckpointManager, OffsetTracker};
use crate::config::parse::{config_warnings, load_config, ConfigError};
use crate::delivery::FatalError;
use crate::pipeline::{PipelineError, ShutdownReport, SinkPipeline};
use crate::source::{JsonLinesReader, ReaderError};
use crate::writer::{ConfiguredWriterFactory, WriterError, WriterFactory};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("source reader error: {0}")]
    SourceReader(#[from] ReaderError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("{count} partition(s) halted; first failure: {first}")]
    Fatal { count: usize, first: FatalError },
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/sinkflow/config.yml");
            eprintln!("  /etc/sinkflow/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'sinkflow config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_pipeline(&config_path).await.map_err(|e| e.into())
}

async fn run_pipeline(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;
    for warning in config_warnings(&config) {
        warn!("{}", warning);
    }

    let mut checkpoints = config
        .checkpoint
        .enabled
        .then(|| CheckpointManager::new(&config.checkpoint.path, config.checkpoint.interval));

    let committed = match &checkpoints {
        Some(manager) => manager
            .load()
            .await?
            .map(|checkpoint| checkpoint.resume_offsets(config.source.partitions))
            .transpose()?
            .unwrap_or_default(),
        None => BTreeMap::new(),
    };
    let tracker = Arc::new(OffsetTracker::with_committed(committed.clone()));

    info!(writer = config.writer.kind(), "Initializing writer");
    let factory = ConfiguredWriterFactory::from_config(&config.writer)?;
    let pipeline = SinkPipeline::new(config.sink.clone(), factory, tracker.clone());

    let mut reader = JsonLinesReader::open(&config.source)
        .await?
        .skip_committed(committed);

    info!("Pipeline started, press Ctrl+C to shutdown");
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    let report = consume(
        &mut reader,
        pipeline,
        &tracker,
        checkpoints.as_mut(),
        config.sink.shutdown_grace,
        shutdown,
    )
    .await?;

    if reader.skipped() > 0 {
        info!(skipped = reader.skipped(), "Skipped records committed by an earlier run");
    }
    if !report.abandoned.is_empty() {
        warn!(
            partitions = report.abandoned.len(),
            "Some partitions were cut off at shutdown; their records will be redelivered"
        );
    }

    let fatals = tracker.fatals();
    if let Some(first) = fatals.first() {
        return Err(RunError::Fatal {
            count: fatals.len(),
            first: first.clone(),
        });
    }

    info!("Pipeline shutdown complete");
    Ok(())
}

/// Feed records from `reader` into `pipeline` until the source ends, `shutdown`
/// resolves, or any partition reports a fatal verdict to `tracker`. Then shuts the
/// pipeline down and saves a final checkpoint.
pub async fn consume<F, S>(
    reader: &mut JsonLinesReader,
    mut pipeline: SinkPipeline<F>,
    tracker: &OffsetTracker,
    mut checkpoints: Option<&mut CheckpointManager>,
    shutdown_grace: Duration,
    shutdown: S,
) -> Result<ShutdownReport, RunError>
where
    F: WriterFactory,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let partition_count = reader.partitions();
    let mut save_tick = tokio::time::interval(Duration::from_secs(1));
    save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stop_error: Option<RunError> = None;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            _ = tracker.fatal_reported() => {
                error!("Partition halted, stopping consumption");
                break;
            }

            _ = save_tick.tick(), if checkpoints.is_some() => {
                if let Some(manager) = checkpoints.as_deref_mut() {
                    if manager.should_save() {
                        if let Err(e) = manager.save(&tracker.checkpoint(partition_count)).await {
                            warn!(error = %e, "Failed to save checkpoint");
                        }
                    }
                }
            }

            next = reader.next_record() => {
                let record = match next {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        info!("Source exhausted");
                        break;
                    }
                    Err(e) => {
                        stop_error = Some(e.into());
                        break;
                    }
                };

                tokio::select! {
                    biased;

                    _ = &mut shutdown => break,
                    _ = tracker.fatal_reported() => {
                        error!("Partition halted, stopping consumption");
                        break;
                    }
                    result = pipeline.push(record) => match result {
                        Ok(()) => {}
                        Err(PipelineError::PartitionFailed(fatal)) => {
                            error!(error = %fatal, "Partition halted, stopping consumption");
                            break;
                        }
                        Err(e) => {
                            stop_error = Some(e.into());
                            break;
                        }
                    },
                }
            }
        }
    }

    let report = pipeline.shutdown(shutdown_grace).await;

    if let Some(manager) = checkpoints {
        manager.save(&tracker.checkpoint(partition_count)).await?;
        info!(path = %manager.path().display(), "Final checkpoint saved");
    }

    match stop_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
