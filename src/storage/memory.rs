//! In-memory storage backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CycleRecord, Storage, StorageCapacity};
use crate::error::StorageError;
use crate::link::ChannelId;

#[derive(Debug, Default)]
struct Inner {
    records: Vec<CycleRecord>,
    latest: HashMap<ChannelId, DateTime<Utc>>,
    used_bytes: u64,
}

/// Keeps every record in process memory.
///
/// [`MemoryStorage::set_available`] simulates an outage for tests.
///
/// ```
/// use leak_daq::storage::{memory::MemoryStorage, Storage};
///
/// # tokio_test::block_on(async {
/// let storage = MemoryStorage::default();
/// assert!(storage.ping().await.is_ok());
/// storage.set_available(false);
/// assert!(storage.ping().await.is_err());
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    limit_bytes: u64,
    available: AtomicBool,
}

impl MemoryStorage {
    /// Empty store reporting `limit_bytes` of capacity
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            limit_bytes,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; calls fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every persisted record, in order
    pub fn records(&self) -> Vec<CycleRecord> {
        self.inner.lock().records.clone()
    }

    /// Number of persisted records
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// True before the first persist
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory storage offline".to_string()))
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn persist(&self, record: &CycleRecord) -> Result<(), StorageError> {
        self.check()?;
        let size = serde_json::to_vec(record)?.len() as u64;

        let mut inner = self.inner.lock();
        let latest = inner.latest.entry(record.channel).or_insert(record.ended_at);
        if record.ended_at > *latest {
            *latest = record.ended_at;
        }
        inner.used_bytes += size;
        inner.records.push(record.clone());
        Ok(())
    }

    async fn recent_cycle_timestamp(
        &self,
        channel: ChannelId,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.check()?;
        Ok(self.inner.lock().latest.get(&channel).copied())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }

    async fn capacity(&self) -> Result<StorageCapacity, StorageError> {
        self.check()?;
        Ok(StorageCapacity {
            free_bytes: None,
            used_bytes: self.inner.lock().used_bytes,
            limit_bytes: Some(self.limit_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::Termination;
    use uuid::Uuid;

    fn record(channel: ChannelId, ended_ms: i64) -> CycleRecord {
        let at = DateTime::from_timestamp_millis(ended_ms).unwrap();
        CycleRecord {
            id: Uuid::new_v4(),
            channel,
            sequence: 1,
            started_at: at,
            ended_at: at,
            termination: Termination::Normal,
            samples: Vec::new(),
            features: None,
            result: None,
            error: Some("no model".to_string()),
            recorded_at: at,
        }
    }

    #[tokio::test]
    async fn test_tracks_latest_per_channel() {
        let storage = MemoryStorage::default();
        storage.persist(&record(1, 2_000)).await.unwrap();
        storage.persist(&record(1, 1_000)).await.unwrap();
        storage.persist(&record(2, 500)).await.unwrap();

        let latest = storage.recent_cycle_timestamp(1).await.unwrap().unwrap();
        assert_eq!(latest.timestamp_millis(), 2_000);
        assert!(storage.recent_cycle_timestamp(3).await.unwrap().is_none());
        assert_eq!(storage.len(), 3);
        assert!(storage.capacity().await.unwrap().used_bytes > 0);
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let storage = MemoryStorage::default();
        storage.set_available(false);
        assert!(matches!(
            storage.persist(&record(0, 0)).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(storage.ping().await.is_err());

        storage.set_available(true);
        assert!(storage.ping().await.is_ok());
    }
}
