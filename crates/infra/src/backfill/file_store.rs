//! JSON-file backed job and checkpoint stores.
//!
//! Layout under the data directory:
//!
//! ```text
//! <root>/jobs/<job_id>.json
//! <root>/checkpoints/<job_id>.json
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so
//! readers never observe a half-written record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::warn;

use statsboard_core::JobId;

use super::checkpoint::CheckpointStore;
use super::store::{JobFilter, JobStore, StoreError, check_replaceable, sort_newest_first};
use super::types::{BackfillJob, Checkpoint};

const JOBS_DIR: &str = "jobs";
const CHECKPOINTS_DIR: &str = "checkpoints";

fn io_error(context: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Storage(format!("{context} {}: {e}", path.display()))
}

/// A directory of `<id>.json` documents.
#[derive(Debug)]
struct JsonDir {
    root: PathBuf,
}

impl JsonDir {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn ensure(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error("create dir", &self.root, e))
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        let path = self.path_for(id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("stat", &path, e))
    }

    async fn write<T: Serialize + Sync>(&self, id: JobId, value: &T) -> Result<(), StoreError> {
        self.ensure().await?;
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Corrupt(format!("serialize {id}: {e}")))?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))
    }

    async fn read<T: DeserializeOwned>(&self, id: JobId) -> Result<Option<T>, StoreError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Self::decode(&path, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }

    /// Every document in the directory, plus the files that could not be
    /// read or decoded.
    async fn read_all<T: DeserializeOwned>(&self) -> Result<Listing<T>, StoreError> {
        let mut listing = Listing {
            docs: Vec::new(),
            unreadable: Vec::new(),
        };
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(io_error("read dir", &self.root, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read dir", &self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let decoded = match tokio::fs::read(&path).await {
                Ok(bytes) => Self::decode(&path, &bytes),
                Err(e) => Err(io_error("read", &path, e)),
            };
            match decoded {
                Ok(doc) => listing.docs.push(doc),
                Err(e) => listing.unreadable.push(e),
            }
        }
        Ok(listing)
    }

    fn decode<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
    }
}

struct Listing<T> {
    docs: Vec<T>,
    unreadable: Vec<StoreError>,
}

/// Job store keeping one JSON document per job.
///
/// A listing that selects active statuses fails on any unreadable record,
/// since its status is unknown; other listings skip it with a warning.
#[derive(Debug)]
pub struct FileJobStore {
    dir: JsonDir,
    // Serialises check-then-write in create and update.
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: JsonDir::new(data_dir.as_ref().join(JOBS_DIR)),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.dir.exists(job.id).await? {
            return Err(StoreError::AlreadyExists(job.id));
        }
        self.dir.write(job.id, job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BackfillJob>, StoreError> {
        self.dir.read(job_id).await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackfillJob>, StoreError> {
        let Listing { docs, mut unreadable } = self.dir.read_all::<BackfillJob>().await?;
        if !unreadable.is_empty() && filter.targets_active() {
            return Err(unreadable.swap_remove(0));
        }
        for e in &unreadable {
            warn!(error = %e, "skipping unreadable job record");
        }

        let mut jobs: Vec<BackfillJob> = docs.into_iter().filter(|j| filter.matches(j)).collect();
        sort_newest_first(&mut jobs);
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored: BackfillJob = self
            .dir
            .read(job.id)
            .await?
            .ok_or(StoreError::NotFound(job.id))?;
        check_replaceable(&stored)?;
        self.dir.write(job.id, job).await
    }
}

/// Checkpoint store keeping one JSON document per active job.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: JsonDir,
}

impl FileCheckpointStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: JsonDir::new(data_dir.as_ref().join(CHECKPOINTS_DIR)),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.dir.write(job_id, checkpoint).await
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        self.dir.read(job_id).await
    }

    async fn clear(&self, job_id: JobId) -> Result<(), StoreError> {
        self.dir.remove(job_id).await
    }
}
