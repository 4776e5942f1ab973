use crate::record::TopicPartition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const CURRENT_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "checkpoint was written for {stored} partition(s) but the source now has {configured}; \
         keyed records would map to different partitions. Remove the checkpoint to start over"
    )]
    PartitionCountChanged { stored: u32, configured: u32 },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// Source partition count the offsets were assigned under
    pub partition_count: u32,
    pub partitions: Vec<PartitionOffset>,
}

/// Highest acknowledged offset of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl Checkpoint {
    pub fn from_offsets(offsets: &BTreeMap<TopicPartition, u64>, partition_count: u32) -> Self {
        Self {
            version: CURRENT_VERSION,
            timestamp: Utc::now(),
            partition_count,
            partitions: offsets
                .iter()
                .map(|(tp, &offset)| PartitionOffset {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset,
                })
                .collect(),
        }
    }

    pub fn offsets(&self) -> BTreeMap<TopicPartition, u64> {
        self.partitions
            .iter()
            .map(|p| (TopicPartition::new(p.topic.clone(), p.partition), p.offset))
            .collect()
    }

    /// Offsets to resume from. Refused when the source partition count changed,
    /// since keyed records would no longer land at the stored positions.
    pub fn resume_offsets(&self, partition_count: u32) -> Result<BTreeMap<TopicPartition, u64>> {
        if self.partition_count != partition_count {
            return Err(CheckpointError::PartitionCountChanged {
                stored: self.partition_count,
                configured: partition_count,
            });
        }
        Ok(self.offsets())
    }
}

/// Persists checkpoints as a JSON file. Writes go to a temp file that is renamed
/// over the previous checkpoint, so a crash never leaves a torn file behind.
pub struct CheckpointManager {
    path: PathBuf,
    interval: Duration,
    last_save: Instant,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_save: Instant::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        tracing::info!("Loading checkpoint from {}", self.path.display());

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No checkpoint found at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        if checkpoint.version != CURRENT_VERSION {
            tracing::warn!(
                "Checkpoint version mismatch: {} vs {}, ignoring checkpoint",
                checkpoint.version,
                CURRENT_VERSION
            );
            return Ok(None);
        }

        tracing::info!(
            "Loaded checkpoint from {} covering {} partitions",
            checkpoint.timestamp,
            checkpoint.partitions.len()
        );
        Ok(Some(checkpoint))
    }

    pub async fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }

        let json = serde_json::to_vec_pretty(checkpoint)?;
        let temp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        self.last_save = Instant::now();
        tracing::debug!("Checkpoint saved to {}", self.path.display());
        Ok(())
    }

    pub fn should_save(&self) -> bool {
        self.last_save.elapsed() >= self.interval
    }

    pub fn reset_timer(&mut self) {
        self.last_save = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_offsets() -> BTreeMap<TopicPartition, u64> {
        BTreeMap::from([
            (TopicPartition::new("solar", 0), 41),
            (TopicPartition::new("solar", 1), 7),
        ])
    }

    #[tokio::test]
    async fn test_checkpoint_save_load() {
        let dir = TempDir::new().unwrap();
        let mut manager =
            CheckpointManager::new(dir.path().join("state/offsets.json"), Duration::from_secs(30));

        manager
            .save(&Checkpoint::from_offsets(&sample_offsets(), 2))
            .await
            .unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded.version, CURRENT_VERSION);
        assert_eq!(loaded.partition_count, 2);
        assert_eq!(loaded.resume_offsets(2).unwrap(), sample_offsets());
        assert!(!dir.path().join("state/offsets.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path().join("missing.json"), Duration::from_secs(30));
        assert!(manager.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");

        let mut checkpoint = Checkpoint::from_offsets(&sample_offsets(), 2);
        checkpoint.version = 999;
        std::fs::write(&path, serde_json::to_string(&checkpoint).unwrap()).unwrap();

        let manager = CheckpointManager::new(path, Duration::from_secs(30));
        assert!(manager.load().await.unwrap().is_none());
    }

    #[test]
    fn test_resume_refused_when_partition_count_changed() {
        let checkpoint = Checkpoint::from_offsets(&sample_offsets(), 2);

        match checkpoint.resume_offsets(3) {
            Err(CheckpointError::PartitionCountChanged { stored, configured }) => {
                assert_eq!((stored, configured), (2, 3));
            }
            other => panic!("expected partition count error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, "{not json").unwrap();

        let manager = CheckpointManager::new(path, Duration::from_secs(30));
        assert!(matches!(manager.load().await, Err(CheckpointError::Json(_))));
    }

    #[test]
    fn test_should_save_after_interval() {
        let mut manager = CheckpointManager::new("offsets.json", Duration::ZERO);
        assert!(manager.should_save());

        manager.interval = Duration::from_secs(3600);
        manager.reset_timer();
        assert!(!manager.should_save());
    }
}
