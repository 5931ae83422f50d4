//! The backfill façade: validation, single-active-job admission, cancellation,
//! listing, dry-run previews and live rate-limit configuration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use statsboard_core::{DomainError, JobId};

use super::checkpoint::CheckpointStore;
use super::estimate::{HISTORY_LIMIT, estimate_duration};
use super::executor::{ExecutorSettings, JobExecutor};
use super::expansion::{CatalogError, ItemCatalog, expand_items};
use super::file_store::{FileCheckpointStore, FileJobStore};
use super::processor::ProcessorSet;
use super::rate_limiter::{RateLimitWindow, RateLimiter, SharedRateLimitConfig};
use super::request::{CreateJobRequest, validate_request};
use super::store::{JobFilter, JobStore, StoreError};
use super::types::{BackfillJob, JobStatus, JobType, RateLimitConfig, RateLimitPatch};
use crate::config::BackfillSettings;

pub const MAX_PAGE_SIZE: usize = 100;
pub const PREVIEW_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackfillError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {active_job} is already {status}; only one backfill may be active")]
    Conflict { active_job: JobId, status: JobStatus },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("cancellation failed: job {job_id} is already {status}")]
    CancellationFailed { job_id: JobId, status: JobStatus },

    #[error("cancellation of job {0} was not confirmed in time")]
    CancellationUnconfirmed(JobId),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl BackfillError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackfillError::Storage(e) => e.is_retryable(),
            BackfillError::CancellationUnconfirmed(_) => true,
            _ => false,
        }
    }
}

impl From<DomainError> for BackfillError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Validation(msg) => BackfillError::Validation(msg),
            other => BackfillError::Validation(other.to_string()),
        }
    }
}

/// One page of [`UnifiedBackfillService::list_jobs`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub jobs: Vec<BackfillJob>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewAction {
    Process,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewItem {
    pub item_id: String,
    pub districts: Vec<String>,
    pub action: PreviewAction,
}

/// What a job would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPreview {
    pub job_type: JobType,
    pub total_items: u64,
    pub items_to_process: u64,
    pub items_to_skip: u64,
    pub affected_districts: Vec<String>,
    pub estimated_duration_ms: u64,
    /// Limits the job would run under, overrides applied.
    pub rate_limit: RateLimitConfig,
    pub sample: Vec<PreviewItem>,
    pub sample_truncated: bool,
}

#[derive(Debug, Clone)]
struct ExecutionHandle {
    cancel: CancellationToken,
    /// `Some(status)` once the executor has written its terminal status.
    finished: watch::Receiver<Option<JobStatus>>,
}

/// The executor's half of an [`ExecutionHandle`].
struct Registration {
    cancel: CancellationToken,
    finished: watch::Sender<Option<JobStatus>>,
}

type Executions = Arc<Mutex<HashMap<JobId, ExecutionHandle>>>;

fn lock_executions(executions: &Executions) -> MutexGuard<'_, HashMap<JobId, ExecutionHandle>> {
    executions.lock().unwrap_or_else(PoisonError::into_inner)
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub struct UnifiedBackfillService {
    jobs: Arc<dyn JobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    catalog: Arc<dyn ItemCatalog>,
    processors: ProcessorSet,
    rate_limits: SharedRateLimitConfig,
    // One budget against the external source, shared by successive jobs.
    window: RateLimitWindow,
    settings: BackfillSettings,
    // Serialises admission, recovery and orphan cancellation.
    admission: tokio::sync::Mutex<()>,
    executions: Executions,
}

impl UnifiedBackfillService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        catalog: Arc<dyn ItemCatalog>,
        processors: ProcessorSet,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            jobs,
            checkpoints,
            catalog,
            processors,
            rate_limits: SharedRateLimitConfig::new(settings.rate_limit.clone()),
            window: RateLimitWindow::new(),
            settings,
            admission: tokio::sync::Mutex::new(()),
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Service backed by JSON files under `settings.data_dir`.
    pub fn with_file_storage(
        catalog: Arc<dyn ItemCatalog>,
        processors: ProcessorSet,
        settings: BackfillSettings,
    ) -> Self {
        let data_dir: &Path = &settings.data_dir;
        let jobs = Arc::new(FileJobStore::new(data_dir));
        let checkpoints = Arc::new(FileCheckpointStore::new(data_dir));
        Self::new(jobs, checkpoints, catalog, processors, settings)
    }

    /// Validate, admit and start a job. Returns the `pending` record.
    #[instrument(skip_all, fields(job_type = %request.job_type))]
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<BackfillJob, BackfillError> {
        let validated = validate_request(&request, today(), &self.rate_limits.get())?;

        let _admission = self.admission.lock().await;
        if let Some(active) = self.active_job().await? {
            warn!(active_job = %active.id, status = %active.status, "rejecting job: another backfill is active");
            return Err(BackfillError::Conflict {
                active_job: active.id,
                status: active.status,
            });
        }

        let job = BackfillJob::new(validated.job_type, validated.config);
        // Registered before the record exists, so a cancel never sees an
        // active record without its handle.
        let registration = self.register_execution(job.id);
        if let Err(e) = self.jobs.create(&job).await {
            lock_executions(&self.executions).remove(&job.id);
            return Err(e.into());
        }
        info!(job_id = %job.id, "backfill job created");

        self.spawn_executor(job.clone(), registration);
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<BackfillJob, BackfillError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(BackfillError::NotFound(job_id))
    }

    /// The current non-terminal job, if any.
    pub async fn active_job(&self) -> Result<Option<BackfillJob>, BackfillError> {
        Ok(self
            .jobs
            .list(&JobFilter::active(), 1, 0)
            .await?
            .into_iter()
            .next())
    }

    /// Request cancellation and wait until the job is observed `cancelled`.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, BackfillError> {
        let handle = {
            let _admission = self.admission.lock().await;
            // Handle first: an executor deregisters only after its final write,
            // so a missing handle plus an active record means nobody is running
            // the job.
            let handle = lock_executions(&self.executions).get(&job_id).cloned();
            let mut job = self.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Err(BackfillError::CancellationFailed {
                    job_id,
                    status: job.status,
                });
            }

            match handle {
                Some(handle) => handle,
                None => {
                    job.mark_cancelled(Utc::now())?;
                    match self.jobs.update(&job).await {
                        Ok(()) => {}
                        Err(StoreError::Terminal { status, .. }) => {
                            return Err(BackfillError::CancellationFailed { job_id, status });
                        }
                        Err(e) => return Err(e.into()),
                    }
                    if let Err(e) = self.checkpoints.clear(job_id).await {
                        warn!(error = %e, "could not clear checkpoint");
                    }
                    info!("orphaned job cancelled");
                    return Ok(true);
                }
            }
        };

        handle.cancel.cancel();
        info!("cancellation requested");

        let mut finished = handle.finished;
        let status = match tokio::time::timeout(
            self.settings.cancel_confirm_timeout,
            finished.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(status)) => *status,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    timeout_ms = self.settings.cancel_confirm_timeout.as_millis() as u64,
                    "cancellation not confirmed in time"
                );
                return Err(BackfillError::CancellationUnconfirmed(job_id));
            }
        };

        match status {
            Some(JobStatus::Cancelled) => Ok(true),
            Some(status) => Err(BackfillError::CancellationFailed { job_id, status }),
            None => Err(BackfillError::CancellationUnconfirmed(job_id)),
        }
    }

    /// Jobs matching `filter`, newest first. `limit` must be in `1..=100`.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<JobPage, BackfillError> {
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(BackfillError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"
            )));
        }

        let mut jobs = self.jobs.list(filter, limit + 1, offset).await?;
        let has_more = jobs.len() > limit;
        jobs.truncate(limit);
        Ok(JobPage { jobs, has_more })
    }

    /// Dry run: validate and expand like `create_job`, touching nothing.
    pub async fn preview_job(&self, request: &CreateJobRequest) -> Result<JobPreview, BackfillError> {
        let global = self.rate_limits.get();
        let validated = validate_request(request, today(), &global)?;
        let job_type = validated.job_type;
        let config = &validated.config;

        let expanded = expand_items(job_type, config, self.catalog.as_ref()).await?;
        let rate_limit = match &config.rate_limit_overrides {
            Some(patch) => patch.apply_to(&global),
            None => global,
        };

        let mut items_to_skip = 0u64;
        let mut sample = Vec::with_capacity(PREVIEW_SAMPLE_SIZE.min(expanded.len()));
        for item in &expanded.items {
            let skip = config.skip_existing && self.catalog.item_exists(job_type, item).await?;
            if skip {
                items_to_skip += 1;
            }
            if sample.len() < PREVIEW_SAMPLE_SIZE {
                sample.push(PreviewItem {
                    item_id: item.id.clone(),
                    districts: item.districts.clone(),
                    action: if skip {
                        PreviewAction::Skip
                    } else {
                        PreviewAction::Process
                    },
                });
            }
        }

        let total_items = expanded.len() as u64;
        let items_to_process = total_items - items_to_skip;
        let history = self
            .jobs
            .list(
                &JobFilter::default()
                    .with_status(JobStatus::Completed)
                    .with_job_type(job_type),
                HISTORY_LIMIT,
                0,
            )
            .await?;
        let estimated = estimate_duration(items_to_process, &history, &rate_limit);

        Ok(JobPreview {
            job_type,
            total_items,
            items_to_process,
            items_to_skip,
            affected_districts: expanded.districts,
            estimated_duration_ms: estimated.as_millis() as u64,
            rate_limit,
            sample,
            sample_truncated: expanded.items.len() > PREVIEW_SAMPLE_SIZE,
        })
    }

    pub fn get_rate_limit_config(&self) -> RateLimitConfig {
        self.rate_limits.get()
    }

    /// Apply a partial update; takes effect for running jobs on their next permit.
    pub fn update_rate_limit_config(
        &self,
        patch: &RateLimitPatch,
    ) -> Result<RateLimitConfig, BackfillError> {
        let updated = self.rate_limits.update(patch)?;
        info!(
            max_requests_per_minute = updated.max_requests_per_minute,
            max_concurrent = updated.max_concurrent,
            min_delay_ms = updated.min_delay_ms,
            max_delay_ms = updated.max_delay_ms,
            backoff_multiplier = updated.backoff_multiplier,
            "rate limit config updated"
        );
        Ok(updated)
    }

    /// Restart executors for jobs left active by a previous process.
    ///
    /// `running` jobs move to `recovering` first so they resume from their
    /// checkpoint.
    pub async fn recover_interrupted_jobs(&self) -> Result<Vec<JobId>, BackfillError> {
        let _admission = self.admission.lock().await;

        let mut active = Vec::new();
        loop {
            let page = self
                .jobs
                .list(&JobFilter::active(), MAX_PAGE_SIZE, active.len())
                .await?;
            let done = page.len() < MAX_PAGE_SIZE;
            active.extend(page);
            if done {
                break;
            }
        }
        if active.len() > 1 {
            warn!(count = active.len(), "more than one active job found during recovery");
        }

        let mut recovered = Vec::new();
        for mut job in active {
            if lock_executions(&self.executions).contains_key(&job.id) {
                continue;
            }
            if job.status == JobStatus::Running {
                job.mark_recovering()?;
                match self.jobs.update(&job).await {
                    Ok(()) => {}
                    Err(StoreError::Terminal { status, .. }) => {
                        info!(job_id = %job.id, %status, "job already finished, not recovering");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            info!(job_id = %job.id, status = %job.status, "recovering interrupted job");
            recovered.push(job.id);
            let registration = self.register_execution(job.id);
            self.spawn_executor(job, registration);
        }
        Ok(recovered)
    }

    /// Wait for a job's executor to finish, then return the record.
    pub async fn wait_for_completion(&self, job_id: JobId) -> Result<BackfillJob, BackfillError> {
        let handle = lock_executions(&self.executions).get(&job_id).cloned();
        if let Some(mut handle) = handle {
            // A closed channel also means the executor is gone.
            let _ = handle.finished.wait_for(Option::is_some).await;
        }
        self.get_job(job_id).await
    }

    fn register_execution(&self, job_id: JobId) -> Registration {
        let cancel = CancellationToken::new();
        let (finished_tx, finished) = watch::channel(None);
        lock_executions(&self.executions).insert(
            job_id,
            ExecutionHandle {
                cancel: cancel.clone(),
                finished,
            },
        );
        Registration {
            cancel,
            finished: finished_tx,
        }
    }

    fn spawn_executor(&self, job: BackfillJob, registration: Registration) {
        let job_id = job.id;
        let limiter = RateLimiter::with_window(
            self.rate_limits.clone(),
            job.config.rate_limit_overrides.clone(),
            self.window.clone(),
        );
        let executor = JobExecutor::new(
            self.jobs.clone(),
            self.checkpoints.clone(),
            self.catalog.clone(),
            self.processors.for_job_type(job.job_type),
            limiter,
        )
        .with_settings(ExecutorSettings::from(&self.settings))
        .with_cancellation(registration.cancel);

        let executions = self.executions.clone();
        let jobs = self.jobs.clone();
        let finished_tx = registration.finished;
        tokio::spawn(async move {
            let status = match executor.run(job).await {
                Ok(job) => Some(job.status),
                Err(_) => match jobs.get(job_id).await {
                    Ok(Some(job)) if job.status.is_terminal() => Some(job.status),
                    _ => None,
                },
            };
            lock_executions(&executions).remove(&job_id);
            finished_tx.send_replace(status);
        });
    }
}
