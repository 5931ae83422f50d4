//! Test doubles for the external collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use statsboard_core::JobId;

use super::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use super::expansion::{CatalogError, ItemCatalog, WorkItem};
use super::processor::{ItemContext, ItemOutcome, ItemProcessor};
use super::store::{InMemoryJobStore, JobFilter, JobStore, StoreError};
use super::types::{BackfillJob, Checkpoint, JobType};

pub(crate) struct StaticCatalog {
    districts: Vec<String>,
    snapshots: Vec<String>,
    existing: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl StaticCatalog {
    pub(crate) fn new<D, S>(
        districts: impl IntoIterator<Item = D>,
        snapshots: impl IntoIterator<Item = S>,
    ) -> Self
    where
        D: Into<String>,
        S: Into<String>,
    {
        Self {
            districts: districts.into_iter().map(Into::into).collect(),
            snapshots: snapshots.into_iter().map(Into::into).collect(),
            existing: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_existing<'a>(self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.existing
            .lock()
            .unwrap()
            .extend(ids.into_iter().map(str::to_string));
        self
    }

    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CatalogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("catalog offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ItemCatalog for StaticCatalog {
    async fn districts(&self) -> Result<Vec<String>, CatalogError> {
        self.check()?;
        Ok(self.districts.clone())
    }

    async fn snapshot_ids(&self) -> Result<Vec<String>, CatalogError> {
        self.check()?;
        Ok(self.snapshots.clone())
    }

    async fn item_exists(&self, _job_type: JobType, item: &WorkItem) -> Result<bool, CatalogError> {
        self.check()?;
        Ok(self.existing.lock().unwrap().contains(&item.id))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) job_id: JobId,
    pub(crate) item_id: String,
    pub(crate) attempt: u32,
    pub(crate) at: Instant,
}

/// Processor returning scripted outcomes per item, success by default.
#[derive(Default)]
pub(crate) struct ScriptedProcessor {
    scripts: Mutex<HashMap<String, VecDeque<ItemOutcome>>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProcessor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn script(
        self,
        item_id: &str,
        outcomes: impl IntoIterator<Item = ItemOutcome>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.item_id).collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn process(&self, item: &WorkItem, ctx: &ItemContext) -> ItemOutcome {
        self.calls.lock().unwrap().push(Call {
            job_id: ctx.job_id,
            item_id: item.id.clone(),
            attempt: ctx.attempt,
            at: Instant::now(),
        });
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        scripted.unwrap_or_else(|| ItemOutcome::success(format!("artifact-{}", item.id)))
    }
}

/// In-memory job store whose next `n` updates fail with a storage error.
#[derive(Debug, Default)]
pub(crate) struct FlakyJobStore {
    inner: InMemoryJobStore,
    failing_updates: AtomicU32,
    applied_updates: AtomicU32,
}

impl FlakyJobStore {
    pub(crate) fn failing(updates: u32) -> Self {
        Self {
            failing_updates: AtomicU32::new(updates),
            ..Self::default()
        }
    }

    /// Updates that reached the inner store.
    pub(crate) fn applied_updates(&self) -> u32 {
        self.applied_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn create(&self, job: &BackfillJob) -> Result<(), StoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BackfillJob>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackfillJob>, StoreError> {
        self.inner.list(filter, limit, offset).await
    }

    async fn update(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let fail = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Storage("simulated outage".into()));
        }
        self.inner.update(job).await?;
        self.applied_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Checkpoint store that accepts `n` saves, then fails every later one.
#[derive(Debug, Default)]
pub(crate) struct FailingCheckpointStore {
    inner: InMemoryCheckpointStore,
    saves_left: AtomicU32,
}

impl FailingCheckpointStore {
    pub(crate) fn after(saves: u32) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            saves_left: AtomicU32::new(saves),
        }
    }
}

#[async_trait]
impl CheckpointStore for FailingCheckpointStore {
    async fn save(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let allowed = self
            .saves_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StoreError::Storage("checkpoint volume offline".into()));
        }
        self.inner.save(job_id, checkpoint).await
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load(job_id).await
    }

    async fn clear(&self, job_id: JobId) -> Result<(), StoreError> {
        self.inner.clear(job_id).await
    }
}

/// In-memory job store whose `create` returns only after `delay`, with the
/// record already visible to readers.
#[derive(Debug)]
pub(crate) struct SlowCreateJobStore {
    inner: InMemoryJobStore,
    delay: Duration,
}

impl SlowCreateJobStore {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl JobStore for SlowCreateJobStore {
    async fn create(&self, job: &BackfillJob) -> Result<(), StoreError> {
        self.inner.create(job).await?;
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BackfillJob>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn list(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackfillJob>, StoreError> {
        self.inner.list(filter, limit, offset).await
    }

    async fn update(&self, job: &BackfillJob) -> Result<(), StoreError> {
        self.inner.update(job).await
    }
}
