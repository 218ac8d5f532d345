//! JSON-lines storage backend
//!
//! Records are appended to `cycles-YYYYMMDD.jsonl` under the output directory, one
//! JSON object per line, using the record's `recorded_at` date. Free space comes
//! from the volume holding the directory; the footprint is the total size of the
//! record files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sysinfo::Disks;
use tokio::io::AsyncWriteExt;

use super::{CycleRecord, Storage, StorageCapacity};
use crate::error::StorageError;
use crate::link::ChannelId;

const FILE_PREFIX: &str = "cycles-";
const FILE_EXTENSION: &str = "jsonl";

/// Daily JSON-lines files in one directory
#[derive(Debug)]
pub struct JsonlStorage {
    dir: PathBuf,
    limit_bytes: u64,
    latest: Mutex<HashMap<ChannelId, DateTime<Utc>>>,
    // Serialises appends so lines from concurrent workers never interleave
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlStorage {
    /// Create the directory if needed and load the latest timestamps per channel
    pub fn open(dir: &Path, limit_bytes: u64) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let latest = scan_latest(dir)?;
        tracing::debug!(dir = %dir.display(), channels = latest.len(), "JSON-lines storage opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            limit_bytes,
            latest: Mutex::new(latest),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// File holding records recorded on `at`'s date
    pub fn file_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}.{FILE_EXTENSION}", at.format("%Y%m%d")))
    }
}

fn record_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_record_file = path.extension().is_some_and(|ext| ext == FILE_EXTENSION)
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(FILE_PREFIX));
        if is_record_file {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn scan_latest(dir: &Path) -> Result<HashMap<ChannelId, DateTime<Utc>>, StorageError> {
    let mut latest: HashMap<ChannelId, DateTime<Utc>> = HashMap::new();
    // Only the newest file matters for staleness
    let Some(file) = record_files(dir)?.pop() else {
        return Ok(latest);
    };
    let text = std::fs::read_to_string(&file)?;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<CycleRecord>(line) {
            Ok(record) => {
                let entry = latest.entry(record.channel).or_insert(record.ended_at);
                if record.ended_at > *entry {
                    *entry = record.ended_at;
                }
            }
            Err(e) => tracing::warn!(file = %file.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(latest)
}

fn volume_free_bytes(dir: &Path) -> Option<u64> {
    let dir = dir.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[async_trait]
impl Storage for JsonlStorage {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn persist(&self, record: &CycleRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let path = self.file_for(record.recorded_at);

        {
            let _guard = self.write_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&line).await?;
            file.flush().await?;
        }

        let mut latest = self.latest.lock();
        let entry = latest.entry(record.channel).or_insert(record.ended_at);
        if record.ended_at > *entry {
            *entry = record.ended_at;
        }
        Ok(())
    }

    async fn recent_cycle_timestamp(
        &self,
        channel: ChannelId,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.latest.lock().get(&channel).copied())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let meta = tokio::fs::metadata(&self.dir).await.map_err(|e| {
            StorageError::Unavailable(format!("{}: {e}", self.dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(StorageError::Unavailable(format!(
                "{} is read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }

    async fn capacity(&self) -> Result<StorageCapacity, StorageError> {
        let dir = self.dir.clone();
        let limit = self.limit_bytes;
        tokio::task::spawn_blocking(move || -> Result<StorageCapacity, StorageError> {
            let mut used = 0;
            for file in record_files(&dir)? {
                used += std::fs::metadata(file)?.len();
            }
            Ok(StorageCapacity {
                free_bytes: volume_free_bytes(&dir),
                used_bytes: used,
                limit_bytes: Some(limit),
            })
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("capacity task failed: {e}")))?
    }
}
