//! Record storage
//!
//! Persistence is an external collaborator behind the [`Storage`] trait. The core
//! needs four things from it: persist a full cycle record, report the most recent
//! cycle timestamp per channel (staleness checks), answer a reachability probe, and
//! report capacity.
//!
//! Two backends ship with the crate:
//! - [`memory::MemoryStorage`]: in-process, for tests and mock runs
//! - [`jsonl::JsonlStorage`]: one JSON record per line in daily files

pub mod jsonl;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acquisition::{CycleWindow, Termination};
use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;
use crate::link::{ChannelId, ChannelSample};
use crate::pipeline::features::Features;
use crate::pipeline::InferenceResult;

/// One persisted cycle: raw window, features and result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Record id
    pub id: Uuid,
    /// Channel of the cycle
    pub channel: ChannelId,
    /// Cycle sequence on that channel
    pub sequence: u64,
    /// Capture time of the first sample
    pub started_at: DateTime<Utc>,
    /// Capture time of the last sample
    pub ended_at: DateTime<Utc>,
    /// How the cycle ended
    pub termination: Termination,
    /// Raw window
    pub samples: Vec<ChannelSample>,
    /// Absent when extraction failed
    pub features: Option<Features>,
    /// Absent when classification failed
    pub result: Option<InferenceResult>,
    /// Why `result` is absent
    pub error: Option<String>,
    /// When the record was built
    pub recorded_at: DateTime<Utc>,
}

impl CycleRecord {
    /// Record for a window and its classification outcome
    pub fn new(
        window: &CycleWindow,
        features: Option<Features>,
        outcome: Result<InferenceResult, String>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            id: Uuid::new_v4(),
            channel: window.channel(),
            sequence: window.sequence(),
            started_at: window.started_at(),
            ended_at: window.ended_at(),
            termination: window.termination(),
            samples: window.samples().to_vec(),
            features,
            result,
            error,
            recorded_at: Utc::now(),
        }
    }
}

/// Capacity figures reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageCapacity {
    /// Free bytes on the backing volume, if known
    pub free_bytes: Option<u64>,
    /// Bytes used by stored records
    pub used_bytes: u64,
    /// Configured footprint limit
    pub limit_bytes: Option<u64>,
}

impl StorageCapacity {
    /// Fraction of the footprint limit in use
    pub fn usage_ratio(&self) -> Option<f64> {
        self.limit_bytes
            .filter(|limit| *limit > 0)
            .map(|limit| self.used_bytes as f64 / limit as f64)
    }
}

/// Persistence collaborator
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Store one record
    async fn persist(&self, record: &CycleRecord) -> Result<(), StorageError>;

    /// End time of the most recent persisted cycle on `channel`
    async fn recent_cycle_timestamp(
        &self,
        channel: ChannelId,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), StorageError>;

    /// Free and used bytes
    async fn capacity(&self) -> Result<StorageCapacity, StorageError>;
}

/// Build the configured backend
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = match config.backend {
        StorageBackend::Memory => Arc::new(memory::MemoryStorage::new(config.capacity_limit_bytes)),
        StorageBackend::Jsonl => Arc::new(jsonl::JsonlStorage::open(
            &config.output_dir,
            config.capacity_limit_bytes,
        )?),
    };
    tracing::info!(backend = storage.name(), "Storage initialised");
    Ok(storage)
}
