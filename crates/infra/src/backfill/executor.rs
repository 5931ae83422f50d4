//! Drives one backfill job from `pending`/`recovering` to a terminal status.
//!
//! Items are processed sequentially in expansion order. For each item the
//! executor acquires a rate-limit permit, calls the job type's processor,
//! records the outcome, saves the checkpoint and persists the job record.
//! Cancellation is cooperative: it is observed before each item, while
//! waiting for a permit and after each item; an in-flight processor call
//! always runs to completion.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use statsboard_core::{DomainError, JobId};

use super::checkpoint::CheckpointStore;
use super::expansion::{ItemCatalog, WorkItem, expand_items};
use super::processor::{ItemContext, ItemOutcome, ItemProcessor};
use super::rate_limiter::RateLimiter;
use super::store::{JobStore, StoreError};
use super::types::{BackfillJob, Checkpoint, ItemDisposition, JobProgress, JobStatus, RetryPolicy};
use crate::config::BackfillSettings;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] DomainError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Attempts per item for retryable failures, including the first.
    pub max_item_attempts: u32,
    /// Retry policy for job and checkpoint writes.
    pub persist_retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&BackfillSettings::default())
    }
}

impl From<&BackfillSettings> for ExecutorSettings {
    fn from(settings: &BackfillSettings) -> Self {
        Self {
            max_item_attempts: settings.max_item_attempts.max(1),
            persist_retry: settings.persist_retry.clone(),
        }
    }
}

enum ItemRun {
    Done(ItemDisposition),
    Fatal(String),
    Cancelled,
}

enum Ending {
    Completed,
    Failed(String),
    Cancelled,
}

pub struct JobExecutor {
    jobs: Arc<dyn JobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    catalog: Arc<dyn ItemCatalog>,
    processor: Arc<dyn ItemProcessor>,
    limiter: RateLimiter,
    settings: ExecutorSettings,
    cancel: CancellationToken,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        catalog: Arc<dyn ItemCatalog>,
        processor: Arc<dyn ItemProcessor>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            jobs,
            checkpoints,
            catalog,
            processor,
            limiter,
            settings: ExecutorSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `job` to a terminal status and return the final record.
    ///
    /// On an unrecoverable storage error the job is marked `failed` on a
    /// best-effort basis and the error is returned. If the stored record turns
    /// out to be terminal already (cancelled while no executor was
    /// registered), the executor stops and returns that record.
    #[instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type))]
    pub async fn run(self, mut job: BackfillJob) -> Result<BackfillJob, ExecutionError> {
        if job.status.is_terminal() {
            debug!(status = %job.status, "job already terminal, nothing to run");
            return Ok(job);
        }

        match self.drive(&mut job).await {
            Ok(()) => {
                self.clear_checkpoint(job.id).await;
                Ok(job)
            }
            Err(ExecutionError::Store(StoreError::Terminal { status, .. })) => {
                info!(%status, "job finished elsewhere, stopping");
                self.clear_checkpoint(job.id).await;
                let stored = self.jobs.get(job.id).await?;
                Ok(stored.unwrap_or(job))
            }
            Err(e) => {
                error!(error = %e, "job execution aborted");
                if job.status.is_active() && job.mark_failed(Utc::now(), e.to_string()).is_ok() {
                    match self.jobs.update(&job).await {
                        Ok(()) => self.clear_checkpoint(job.id).await,
                        Err(write) => {
                            warn!(error = %write, "could not record job failure");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, job: &mut BackfillJob) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return self.finish(job, Ending::Cancelled).await;
        }

        let expanded = match expand_items(job.job_type, &job.config, self.catalog.as_ref()).await {
            Ok(expanded) => expanded,
            Err(e) => {
                error!(error = %e, "item expansion failed");
                return self
                    .finish(job, Ending::Failed(format!("item expansion failed: {e}")))
                    .await;
            }
        };

        let resuming = job.status == JobStatus::Recovering;
        let mut checkpoint = if resuming {
            self.load_checkpoint(job).await
        } else {
            Checkpoint::default()
        };

        if resuming {
            let already_done = expanded
                .items
                .iter()
                .filter(|item| checkpoint.contains(&item.id))
                .count() as u64;
            let progress = &mut job.progress;
            progress.total_items = expanded.len() as u64;
            progress.processed_items = progress.processed_items.max(already_done);
            progress.current_item = None;
            if progress.district_progress.is_empty() {
                progress.district_progress =
                    JobProgress::new(0, expanded.district_totals()).district_progress;
            }
        } else {
            job.progress = JobProgress::new(expanded.len() as u64, expanded.district_totals());
        }

        let pending: Vec<&WorkItem> = expanded
            .items
            .iter()
            .filter(|item| !checkpoint.contains(&item.id))
            .collect();
        if let Some(first) = pending.first() {
            job.progress.start_item(&first.id, &first.districts);
        }

        job.mark_running(Utc::now())?;
        self.persist_job(job).await?;
        info!(
            total_items = job.progress.total_items,
            already_done = job.progress.processed_items,
            resumed = resuming,
            "job running"
        );

        for (index, item) in pending.iter().enumerate() {
            let disposition = match self.run_item(job, item).await {
                ItemRun::Done(disposition) => disposition,
                ItemRun::Cancelled => return self.finish(job, Ending::Cancelled).await,
                ItemRun::Fatal(message) => {
                    job.progress.finish_item(
                        &item.districts,
                        &ItemDisposition::Failed {
                            message: message.clone(),
                        },
                    );
                    let reason = format!("item {} failed: {message}", item.id);
                    return self.finish(job, Ending::Failed(reason)).await;
                }
            };

            job.progress.finish_item(&item.districts, &disposition);
            checkpoint.record(&item.id, Utc::now());
            self.save_checkpoint(job.id, &checkpoint).await?;
            job.checkpoint = Some(checkpoint.clone());
            debug!(
                item_id = %item.id,
                processed = job.progress.processed_items,
                total = job.progress.total_items,
                "item finished"
            );

            if self.cancel.is_cancelled() {
                return self.finish(job, Ending::Cancelled).await;
            }
            // The next item rides along with this item's write.
            if let Some(next) = pending.get(index + 1) {
                job.progress.start_item(&next.id, &next.districts);
            }
            self.persist_job(job).await?;
        }

        self.finish(job, Ending::Completed).await
    }

    /// Process one item, retrying retryable failures in place.
    async fn run_item(&self, job: &mut BackfillJob, item: &WorkItem) -> ItemRun {
        if job.config.skip_existing {
            match self.catalog.item_exists(job.job_type, item).await {
                Ok(true) => {
                    debug!(item_id = %item.id, "artifact exists, skipping");
                    return ItemRun::Done(ItemDisposition::Skipped);
                }
                Ok(false) => {}
                Err(e) => warn!(item_id = %item.id, error = %e, "existence check failed, processing anyway"),
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ItemRun::Cancelled,
                permit = self.limiter.acquire() => permit,
            };

            let ctx = ItemContext {
                job_id: job.id,
                job_type: job.job_type,
                skip_existing: job.config.skip_existing,
                attempt,
            };
            let outcome = self.processor.process(item, &ctx).await;
            drop(permit);

            match outcome {
                ItemOutcome::Success { artifact_id } => {
                    self.limiter.report_success();
                    if let Some(artifact) = artifact_id {
                        job.progress.artifacts.push(artifact);
                    }
                    return ItemRun::Done(ItemDisposition::Processed);
                }
                ItemOutcome::Skipped { reason } => {
                    debug!(item_id = %item.id, %reason, "processor skipped item");
                    return ItemRun::Done(ItemDisposition::Skipped);
                }
                ItemOutcome::Failed {
                    message,
                    is_retryable,
                } => {
                    self.limiter.report_failure();
                    job.progress
                        .log_error(&item.id, &message, is_retryable, Utc::now());

                    if !is_retryable {
                        error!(item_id = %item.id, error = %message, "non-retryable item failure");
                        return ItemRun::Fatal(message);
                    }
                    if attempt >= self.settings.max_item_attempts {
                        warn!(item_id = %item.id, attempt, error = %message, "item retries exhausted");
                        return ItemRun::Done(ItemDisposition::Failed { message });
                    }
                    warn!(item_id = %item.id, attempt, error = %message, "item failed, retrying");
                }
            }
        }
    }

    async fn finish(&self, job: &mut BackfillJob, ending: Ending) -> Result<(), ExecutionError> {
        let now = Utc::now();
        match ending {
            Ending::Completed => {
                job.mark_completed(now)?;
                info!(
                    processed = job.progress.processed_items,
                    failed = job.progress.failed_items,
                    skipped = job.progress.skipped_items,
                    "job completed"
                );
            }
            Ending::Failed(reason) => {
                job.mark_failed(now, reason)?;
                error!(error = job.error.as_deref().unwrap_or_default(), "job failed");
            }
            Ending::Cancelled => {
                job.mark_cancelled(now)?;
                info!(processed = job.progress.processed_items, "job cancelled");
            }
        }
        self.persist_job(job).await?;
        Ok(())
    }

    /// Stored checkpoint, else the copy embedded in the job record.
    async fn load_checkpoint(&self, job: &BackfillJob) -> Checkpoint {
        match self.checkpoints.load(job.id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => job.checkpoint.clone().unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "checkpoint load failed, using the job's embedded copy");
                job.checkpoint.clone().unwrap_or_default()
            }
        }
    }

    async fn persist_job(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let jobs = &self.jobs;
        retry_write(&self.settings.persist_retry, "job", move || jobs.update(job)).await
    }

    async fn save_checkpoint(&self, job_id: JobId, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let checkpoints = &self.checkpoints;
        retry_write(&self.settings.persist_retry, "checkpoint", move || {
            checkpoints.save(job_id, checkpoint)
        })
        .await
    }

    async fn clear_checkpoint(&self, job_id: JobId) {
        if let Err(e) = self.checkpoints.clear(job_id).await {
            warn!(error = %e, "could not clear checkpoint");
        }
    }
}

/// Run `write`, retrying retryable storage errors per `policy`.
async fn retry_write<F, Fut>(policy: &RetryPolicy, what: &str, mut write: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::NaiveDate;

    use crate::backfill::checkpoint::InMemoryCheckpointStore;
    use crate::backfill::rate_limiter::SharedRateLimitConfig;
    use crate::backfill::store::InMemoryJobStore;
    use crate::backfill::testing::{
        FailingCheckpointStore, FlakyJobStore, ScriptedProcessor, StaticCatalog,
    };
    use crate::backfill::types::{DistrictStatus, JobConfig, JobType, RateLimitConfig};

    fn fast_limits() -> SharedRateLimitConfig {
        SharedRateLimitConfig::new(RateLimitConfig {
            max_requests_per_minute: 1000,
            max_concurrent: 3,
            min_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
        })
    }

    fn three_days() -> BackfillJob {
        BackfillJob::new(
            JobType::DataCollection,
            JobConfig {
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
                end_date: NaiveDate::from_ymd_opt(2024, 1, 3),
                ..Default::default()
            },
        )
    }

    struct Harness {
        jobs: Arc<dyn JobStore>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        catalog: Arc<StaticCatalog>,
        processor: Arc<ScriptedProcessor>,
        limits: SharedRateLimitConfig,
    }

    impl Harness {
        fn new(processor: ScriptedProcessor) -> Self {
            Self::with_store(Arc::new(InMemoryJobStore::new()), processor)
        }

        fn with_store(jobs: Arc<dyn JobStore>, processor: ScriptedProcessor) -> Self {
            Self {
                jobs,
                checkpoints: InMemoryCheckpointStore::arc(),
                catalog: Arc::new(StaticCatalog::new(["D1", "D2"], ["snap-a", "snap-b"])),
                processor: Arc::new(processor),
                limits: fast_limits(),
            }
        }

        fn executor(&self, job: &BackfillJob) -> JobExecutor {
            JobExecutor::new(
                self.jobs.clone(),
                self.checkpoints.clone(),
                self.catalog.clone(),
                self.processor.clone(),
                RateLimiter::new(self.limits.clone(), job.config.rate_limit_overrides.clone()),
            )
        }

        async fn run(&self, job: BackfillJob) -> BackfillJob {
            self.jobs.create(&job).await.unwrap();
            self.executor(&job).run(job).await.unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_item_and_completes() {
        let h = Harness::new(ScriptedProcessor::new());
        let job = h.run(three_days()).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.processor.call_ids(), vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        let result = job.result.as_ref().unwrap();
        assert_eq!(result.items_processed, 3);
        assert_eq!(result.artifacts.len(), 3);
        assert_eq!(job.progress.district_progress["D1"].status, DistrictStatus::Completed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored, job);
        assert!(h.checkpoints.load(job.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recovering_job_skips_checkpointed_items() {
        let h = Harness::new(ScriptedProcessor::new());
        let mut job = three_days();
        job.mark_running(Utc::now()).unwrap();
        job.progress = JobProgress::new(3, [("D1".into(), 3), ("D2".into(), 3)].into());
        job.progress.processed_items = 1;
        job.mark_recovering().unwrap();

        let mut checkpoint = Checkpoint::default();
        checkpoint.record("2024-01-01", Utc::now());
        h.checkpoints.save(job.id, &checkpoint).await.unwrap();

        let job = h.run(job).await;

        assert_eq!(h.processor.call_ids(), vec!["2024-01-02", "2024-01-03"]);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.processed_items, 3);
        assert!(job.resumed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_reconciles_counter_with_checkpoint() {
        let h = Harness::new(ScriptedProcessor::new());
        let mut job = three_days();
        job.mark_running(Utc::now()).unwrap();
        job.mark_recovering().unwrap();
        // The crash hit between the checkpoint save and the job write.
        let mut checkpoint = Checkpoint::default();
        checkpoint.record("2024-01-01", Utc::now());
        checkpoint.record("2024-01-02", Utc::now());
        job.checkpoint = Some(checkpoint);

        let job = h.run(job).await;
        assert_eq!(h.processor.call_ids(), vec!["2024-01-03"]);
        assert_eq!(job.progress.processed_items, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_in_place() {
        let processor = ScriptedProcessor::new().script(
            "2024-01-02",
            [ItemOutcome::retryable("503"), ItemOutcome::retryable("503")],
        );
        let h = Harness::new(processor);
        let job = h.run(three_days()).await;

        let attempts: Vec<_> = h
            .processor
            .calls()
            .into_iter()
            .filter(|c| c.item_id == "2024-01-02")
            .map(|c| c.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.failed_items, 0);
        assert_eq!(job.progress.errors.len(), 2);
        assert!(job.progress.errors.iter().all(|e| e.is_retryable));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_count_once_and_job_continues() {
        let processor = ScriptedProcessor::new().script(
            "2024-01-01",
            std::iter::repeat_n(ItemOutcome::retryable("timeout"), 5),
        );
        let h = Harness::new(processor);
        let job = h.run(three_days()).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.failed_items, 1);
        assert_eq!(job.progress.processed_items, 3);
        assert_eq!(job.progress.errors.len(), 3);
        assert_eq!(job.result.as_ref().unwrap().items_failed, 1);
        assert_eq!(job.progress.district_progress["D2"].status, DistrictStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_fails_the_job() {
        let processor = ScriptedProcessor::new()
            .script("2024-01-02", [ItemOutcome::fatal("credentials rejected")]);
        let h = Harness::new(processor);
        let job = h.run(three_days()).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert!(job.error.as_deref().unwrap().contains("credentials rejected"));
        assert_eq!(h.processor.call_ids(), vec!["2024-01-01", "2024-01-02"]);
        assert!(h.checkpoints.load(job.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_never_runs() {
        let h = Harness::new(ScriptedProcessor::new());
        let job = three_days();
        h.jobs.create(&job).await.unwrap();

        let executor = h.executor(&job);
        executor.cancellation_token().cancel();
        let job = executor.run(job).await.unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_some());
        assert!(h.processor.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_permit_wait() {
        let h = Harness::new(ScriptedProcessor::new());
        h.limits
            .update(&crate::backfill::types::RateLimitPatch {
                max_requests_per_minute: Some(1),
                ..Default::default()
            })
            .unwrap();

        let job = three_days();
        h.jobs.create(&job).await.unwrap();
        let executor = h.executor(&job);
        let token = executor.cancellation_token();
        let handle = tokio::spawn(executor.run(job));

        // The second item waits a full minute for a window slot.
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        let job = handle.await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(h.processor.call_ids(), vec!["2024-01-01"]);
        assert_eq!(job.progress.processed_items, 1);
        assert!(job.progress.current_item.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_artifacts_are_skipped_without_a_permit() {
        let h = Harness {
            catalog: Arc::new(StaticCatalog::new(["D1"], Vec::<String>::new()).with_existing(["2024-01-02"])),
            ..Harness::new(ScriptedProcessor::new())
        };
        let job = h.run(three_days()).await;

        assert_eq!(h.processor.call_ids(), vec!["2024-01-01", "2024-01-03"]);
        assert_eq!(job.progress.skipped_items, 1);
        assert_eq!(job.progress.processed_items, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_write_failures_are_retried() {
        let h = Harness::with_store(Arc::new(FlakyJobStore::failing(3)), ScriptedProcessor::new());
        let job = h.run(three_days()).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn expansion_failure_fails_pending_job() {
        let h = Harness::new(ScriptedProcessor::new());
        h.catalog.set_unavailable(true);
        let job = h
            .run(BackfillJob::new(JobType::AnalyticsGeneration, JobConfig::default()))
            .await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
        assert!(job.error.as_deref().unwrap().contains("expansion"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_job_write_per_item() {
        let jobs = Arc::new(FlakyJobStore::failing(0));
        let h = Harness::with_store(jobs.clone(), ScriptedProcessor::new());
        h.run(three_days()).await;

        // running, one per item, terminal
        assert_eq!(jobs.applied_updates(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_record_names_the_item_in_flight() {
        let h = Harness::new(ScriptedProcessor::new().with_delay(Duration::from_secs(10)));
        let job = three_days();
        h.jobs.create(&job).await.unwrap();
        let handle = tokio::spawn(h.executor(&job).run(job.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress.current_item.as_deref(), Some("2024-01-01"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress.current_item.as_deref(), Some("2024-01-02"));
        assert_eq!(stored.progress.processed_items, 1);

        let finished = handle.await.unwrap().unwrap();
        assert!(finished.progress.current_item.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_copy_of_cancelled_job_does_not_run() {
        let h = Harness::new(ScriptedProcessor::new());
        let job = three_days();
        h.jobs.create(&job).await.unwrap();

        let mut cancelled = job.clone();
        cancelled.mark_cancelled(Utc::now()).unwrap();
        h.jobs.update(&cancelled).await.unwrap();

        let finished = h.executor(&job).run(job).await.unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert!(h.processor.calls().is_empty());
        let stored = h.jobs.get(finished.id).await.unwrap().unwrap();
        assert_eq!(stored, cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_write_failure_fails_the_job() {
        let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let processor = Arc::new(ScriptedProcessor::new());
        let job = three_days();
        jobs.create(&job).await.unwrap();

        let executor = JobExecutor::new(
            jobs.clone(),
            Arc::new(FailingCheckpointStore::after(1)),
            Arc::new(StaticCatalog::new(["D1"], Vec::<String>::new())),
            processor.clone(),
            RateLimiter::new(fast_limits(), None),
        );
        let err = executor.run(job.clone()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Store(StoreError::Storage(_))));
        assert_eq!(processor.call_ids(), vec!["2024-01-01", "2024-01-02"]);

        let stored = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.as_deref().unwrap().contains("checkpoint volume offline"));
        let embedded = stored.checkpoint.unwrap();
        assert!(embedded.contains("2024-01-01"));
        assert!(!embedded.contains("2024-01-02"));
    }
}
