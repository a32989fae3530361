use super::permissions::{FilePermissions, PermissionError};
use crate::buffer::Batch;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const FILE_SUFFIX: &str = ".ai.json";
pub const DIRECTORY_PREFIX: &str = "telemetry-channel-";

// Bound on timestamp bumps when several records land in the same millisecond.
const MAX_NAME_ATTEMPTS: u64 = 1000;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Permission error: {0}")]
    PermissionError(#[from] PermissionError),
    #[error("Disk space exceeded: {current} bytes stored + {incoming} incoming > {limit} limit")]
    DiskSpaceExceeded {
        current: u64,
        incoming: u64,
        limit: u64,
    },
    #[error("No free record name in {0}")]
    NameExhausted(PathBuf),
    #[error("System time error: {0}")]
    SystemTimeError(String),
}

#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub storage_dir: PathBuf,
    pub max_bytes_on_disk: u64,
    pub retention_period: Duration,
    pub cleanup_interval: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            storage_dir: Self::storage_dir_for(&std::env::temp_dir(), ""),
            max_bytes_on_disk: 50_000_000,
            retention_period: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl DiskConfig {
    /// Per-instrumentation-key directory, so that independent senders never
    /// read or delete each other's records.
    pub fn storage_dir_for(base: &Path, instrumentation_key: &str) -> PathBuf {
        base.join(format!("{DIRECTORY_PREFIX}{instrumentation_key}"))
    }
}

/// Bounded, time-limited overflow buffer for batches that could not be sent.
///
/// One file per batch, named `<epoch millis>.ai.json`, holding a JSON array
/// of the serialized envelopes. Writes are refused (never evicting) once the
/// directory would exceed `max_bytes_on_disk`.
#[derive(Debug)]
pub struct DiskOverflowStore {
    config: DiskConfig,
    permissions: FilePermissions,
}

impl DiskOverflowStore {
    pub fn new(config: DiskConfig) -> Self {
        Self {
            config,
            permissions: FilePermissions::new(),
        }
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    pub fn permissions(&self) -> &FilePermissions {
        &self.permissions
    }

    /// Persist a batch. Failures are logged here; callers may ignore the result.
    pub async fn store_to_disk(&self, batch: &Batch) -> Result<PathBuf, DiskError> {
        let result = self.try_store(batch).await;
        log_store_result(batch, &result);
        result
    }

    /// Same contract as [`store_to_disk`](Self::store_to_disk) using only
    /// blocking calls, for paths where the process is about to exit.
    pub fn store_to_disk_sync(&self, batch: &Batch) -> Result<PathBuf, DiskError> {
        let result = self.try_store_sync(batch);
        log_store_result(batch, &result);
        result
    }

    /// Remove the oldest record and return its batch. The file is deleted
    /// before the batch is handed back, so a crash during resend loses it
    /// rather than delivering it twice.
    pub async fn load_oldest(&self) -> Result<Option<Batch>, DiskError> {
        let Some(name) = self.list_records().await?.into_iter().next() else {
            return Ok(None);
        };
        let path = self.config.storage_dir.join(&name);

        let data = fs::read(&path).await?;
        fs::remove_file(&path).await?;
        debug!(path = %path.display(), "Removed record from disk for resend");

        let items: Vec<String> = serde_json::from_slice(&data)?;
        Ok(Some(Batch::new(items)))
    }

    /// Delete every record whose timestamp is older than the retention period.
    pub async fn cleanup_expired(&self) -> Result<usize, DiskError> {
        let now = now_millis()?;
        let retention = self.config.retention_period.as_millis() as u64;
        let mut deleted = 0;

        for name in self.list_records().await? {
            let Some(created) = record_timestamp(&name) else {
                continue;
            };
            if now.saturating_sub(created) > retention {
                match fs::remove_file(self.config.storage_dir.join(&name)).await {
                    Ok(()) => deleted += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!(file = %name, error = %e, "Failed to delete expired record"),
                }
            }
        }

        if deleted > 0 {
            info!("Cleaned up {deleted} expired records from disk");
        }
        Ok(deleted)
    }

    /// Record file names, oldest first. A missing directory has no records.
    pub async fn list_records(&self) -> Result<Vec<String>, DiskError> {
        let mut entries = match fs::read_dir(&self.config.storage_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && name.ends_with(FILE_SUFFIX)
                && entry.file_type().await?.is_file()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Sum of the sizes of the files directly inside the storage directory.
    pub async fn current_size(&self) -> Result<u64, DiskError> {
        let mut total = 0u64;
        let mut entries = match fs::read_dir(&self.config.storage_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    async fn try_store(&self, batch: &Batch) -> Result<PathBuf, DiskError> {
        let dir = &self.config.storage_dir;
        fs::create_dir_all(dir).await?;
        self.permissions.harden_directory(dir).await?;

        let data = serde_json::to_vec(batch.items())?;
        self.check_capacity(self.current_size().await?, data.len() as u64)?;

        let mut millis = now_millis()?;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = record_path(dir, millis);
            match owner_only_options().open(&path).await {
                Ok(mut file) => {
                    file.write_all(&data).await?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DiskError::NameExhausted(dir.clone()))
    }

    fn try_store_sync(&self, batch: &Batch) -> Result<PathBuf, DiskError> {
        use std::io::Write;

        let dir = &self.config.storage_dir;
        std::fs::create_dir_all(dir)?;
        self.permissions.harden_directory_sync(dir)?;

        let data = serde_json::to_vec(batch.items())?;
        self.check_capacity(directory_size_sync(dir)?, data.len() as u64)?;

        let mut millis = now_millis()?;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = record_path(dir, millis);
            match owner_only_options_sync().open(&path) {
                Ok(mut file) => {
                    file.write_all(&data)?;
                    file.flush()?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DiskError::NameExhausted(dir.clone()))
    }

    fn check_capacity(&self, current: u64, incoming: u64) -> Result<(), DiskError> {
        let limit = self.config.max_bytes_on_disk;
        if current.saturating_add(incoming) > limit {
            return Err(DiskError::DiskSpaceExceeded {
                current,
                incoming,
                limit,
            });
        }
        Ok(())
    }
}

fn log_store_result(batch: &Batch, result: &Result<PathBuf, DiskError>) {
    match result {
        Ok(path) => debug!(
            batch_id = batch.id(),
            items = batch.size(),
            path = %path.display(),
            "Stored batch to disk"
        ),
        Err(DiskError::DiskSpaceExceeded { current, limit, .. }) => warn!(
            batch_id = batch.id(),
            current,
            limit,
            "Not saving batch to disk, maximum bytes on disk reached"
        ),
        Err(e) => warn!(batch_id = batch.id(), error = %e, "Failed to store batch to disk"),
    }
}

fn record_path(dir: &Path, millis: u64) -> PathBuf {
    dir.join(format!("{millis}{FILE_SUFFIX}"))
}

fn record_timestamp(name: &str) -> Option<u64> {
    name.strip_suffix(FILE_SUFFIX)?.parse().ok()
}

fn now_millis() -> Result<u64, DiskError> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DiskError::SystemTimeError(format!("Invalid system time: {e}")))?
        .as_millis() as u64)
}

fn owner_only_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
}

fn owner_only_options_sync() -> std::fs::OpenOptions {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

fn directory_size_sync(dir: &Path) -> Result<u64, DiskError> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}
