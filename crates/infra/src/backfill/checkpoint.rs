//! Checkpoint persistence for resumable jobs.
//!
//! A checkpoint lists the items a job has finished. It is saved after every
//! item, so a crash loses at most the item that was in flight. On resume the
//! executor skips every checkpointed item without calling the processor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use statsboard_core::JobId;

use super::store::StoreError;
use super::types::Checkpoint;

/// Checkpoint store for per-job resume cursors.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the checkpoint, replacing any previous one.
    async fn save(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Load the last saved checkpoint.
    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError>;

    /// Drop the checkpoint once the job is terminal.
    async fn clear(&self, job_id: JobId) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn save(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        (**self).save(job_id, checkpoint).await
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        (**self).load(job_id).await
    }

    async fn clear(&self, job_id: JobId) -> Result<(), StoreError> {
        (**self).clear(job_id).await
    }
}

/// In-memory checkpoint store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<JobId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| Self::poisoned())?;
        checkpoints.insert(job_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.read().map_err(|_| Self::poisoned())?;
        Ok(checkpoints.get(&job_id).cloned())
    }

    async fn clear(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| Self::poisoned())?;
        checkpoints.remove(&job_id);
        Ok(())
    }
}
