// FrancoDB - single-node relational storage engine
// Core library module

pub mod buffer;
pub mod catalog;
pub mod common;
pub mod engine;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use engine::Engine;
pub use error::{DbError, Result};

/// Engine configuration, consumed by [`Engine::open`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Base directory for database files, WAL streams and the master record.
    pub data_dir: String,
    /// Name of the database this engine instance serves.
    pub database: String,
    /// Total number of frames across all buffer partitions.
    pub buffer_pool_size: usize,
    /// Number of buffer pool partitions.
    pub buffer_partitions: usize,
    /// Background checkpoint interval in seconds.
    pub checkpoint_interval_secs: u64,
    /// Appended-record count that triggers a checkpoint. Zero disables.
    pub checkpoint_ops_threshold: u32,
    /// Reverse-delta cutoff for time travel, in microseconds.
    pub reverse_delta_threshold_us: u64,
    /// Optional page encryption key.
    pub encryption_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            database: "franco".to_string(),
            buffer_pool_size: common::BUFFER_POOL_SIZE,
            buffer_partitions: common::BUFFER_POOL_PARTITIONS,
            checkpoint_interval_secs: common::CHECKPOINT_INTERVAL_SECS,
            checkpoint_ops_threshold: common::CHECKPOINT_OPS_THRESHOLD,
            reverse_delta_threshold_us: common::REVERSE_DELTA_THRESHOLD_US,
            encryption_key: None,
        }
    }
}
