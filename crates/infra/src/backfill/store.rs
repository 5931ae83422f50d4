//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use statsboard_core::JobId;

use super::types::{BackfillJob, JobStatus, JobType};

/// Persistence error shared by job and checkpoint stores.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} is already {status}")]
    Terminal { job_id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Backend unavailability is transient; identity errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

/// Status/type filter for [`JobStore::list`]. Empty vectors match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub job_types: Vec<JobType>,
}

impl JobFilter {
    pub fn active() -> Self {
        Self {
            statuses: JobStatus::ACTIVE.to_vec(),
            job_types: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_job_type(mut self, job_type: JobType) -> Self {
        self.job_types.push(job_type);
        self
    }

    /// Whether the filter selects non-terminal jobs by status.
    pub fn targets_active(&self) -> bool {
        self.statuses.iter().any(JobStatus::is_active)
    }

    pub fn matches(&self, job: &BackfillJob) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.job_types.is_empty() || self.job_types.contains(&job.job_type))
    }
}

/// Rejects replacing a record that already reached a terminal status.
pub(crate) fn check_replaceable(stored: &BackfillJob) -> Result<(), StoreError> {
    if stored.status.is_terminal() {
        return Err(StoreError::Terminal {
            job_id: stored.id,
            status: stored.status,
        });
    }
    Ok(())
}

/// Newest-created first; ids are time ordered so they break timestamp ties.
pub(crate) fn sort_newest_first(jobs: &mut [BackfillJob]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

/// Durable record of every backfill job.
///
/// `update` replaces the whole record atomically. While a job is active only
/// its executor writes it, so read-modify-write through `get` + `update` is
/// safe without further locking. A stored terminal record is never replaced:
/// `update` fails with [`StoreError::Terminal`] instead.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn create(&self, job: &BackfillJob) -> Result<(), StoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<BackfillJob>, StoreError>;

    /// Jobs matching `filter`, newest first, after skipping `offset`.
    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackfillJob>, StoreError>;

    /// Replace an existing, non-terminal job record.
    async fn update(&self, job: &BackfillJob) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, job: &BackfillJob) -> Result<(), StoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BackfillJob>, StoreError> {
        (**self).get(job_id).await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackfillJob>, StoreError> {
        (**self).list(filter, limit, offset).await
    }

    async fn update(&self, job: &BackfillJob) -> Result<(), StoreError> {
        (**self).update(job).await
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, BackfillJob>>,
}

impl InMemoryJobStore {
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
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BackfillJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackfillJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        drop(jobs);

        sort_newest_first(&mut result);
        Ok(result.into_iter().skip(offset).take(limit).collect())
    }

    async fn update(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                check_replaceable(existing)?;
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(job.id)),
        }
    }
}
