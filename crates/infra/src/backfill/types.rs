//! Core backfill job types: lifecycle, configuration, progress and checkpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use statsboard_core::{DateRange, DomainError, DomainResult, JobId};

/// Kind of work a job performs. Selects the item processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Fetch one dashboard snapshot per calendar day.
    DataCollection,
    /// Compute analytics for snapshots already on disk.
    AnalyticsGeneration,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::DataCollection, JobType::AnalyticsGeneration];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DataCollection => "data-collection",
            JobType::AnalyticsGeneration => "analytics-generation",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unknown job type {s:?} (expected data-collection or analytics-generation)"
                ))
            })
    }
}

/// Job lifecycle status.
///
/// ```text
/// pending ──► running ──► completed
///    │          │  ▲
///    │          ▼  │
///    │       recovering
///    │
///    ├──► failed      from pending, running or recovering
///    └──► cancelled   from pending, running or recovering
/// ```
///
/// `pending → failed` covers a job whose items cannot be expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Persisted, executor not yet started
    Pending,
    /// Executor is iterating items
    Running,
    /// Interrupted by a restart; resumes from its checkpoint
    Recovering,
    /// All items handled
    Completed,
    /// Aborted by a fatal error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Running, JobStatus::Recovering];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Recovering => "recovering",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled | Recovering) => true,
            (Recovering, Running | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "recovering" => Ok(JobStatus::Recovering),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(DomainError::validation(format!("unknown job status {s:?}"))),
        }
    }
}

/// Outbound throttling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests_per_minute: u32,
    pub max_concurrent: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RateLimitConfig {
    pub const REQUESTS_PER_MINUTE: (u32, u32) = (1, 1000);
    pub const CONCURRENT: (u32, u32) = (1, 100);
    pub const MIN_DELAY_MS: (u64, u64) = (0, 60_000);
    pub const MAX_DELAY_MS: (u64, u64) = (0, 300_000);
    pub const BACKOFF_MULTIPLIER: (f64, f64) = (1.0, 10.0);

    /// Check every field's bounds and `min_delay_ms <= max_delay_ms`.
    pub fn validate(&self) -> DomainResult<()> {
        check_range(
            "max_requests_per_minute",
            self.max_requests_per_minute,
            Self::REQUESTS_PER_MINUTE,
        )?;
        check_range("max_concurrent", self.max_concurrent, Self::CONCURRENT)?;
        check_range("min_delay_ms", self.min_delay_ms, Self::MIN_DELAY_MS)?;
        check_range("max_delay_ms", self.max_delay_ms, Self::MAX_DELAY_MS)?;

        let (lo, hi) = Self::BACKOFF_MULTIPLIER;
        if !(lo..=hi).contains(&self.backoff_multiplier) {
            return Err(DomainError::validation(format!(
                "backoff_multiplier must be between {lo} and {hi}, got {}",
                self.backoff_multiplier
            )));
        }

        if self.min_delay_ms > self.max_delay_ms {
            return Err(DomainError::validation(format!(
                "min_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Shortest spacing between grants implied by the per-minute cap.
    pub fn window_spacing(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.max_requests_per_minute.max(1)))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            max_concurrent: 3,
            min_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

fn check_range<T>(field: &str, value: T, (lo, hi): (T, T)) -> DomainResult<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value < lo || value > hi {
        return Err(DomainError::validation(format!(
            "{field} must be between {lo} and {hi}, got {value}"
        )));
    }
    Ok(())
}

/// Partial [`RateLimitConfig`]: used for live updates and per-job overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl RateLimitPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Overlay the provided fields onto `base` without validating.
    pub fn apply_to(&self, base: &RateLimitConfig) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_minute: self
                .max_requests_per_minute
                .unwrap_or(base.max_requests_per_minute),
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            min_delay_ms: self.min_delay_ms.unwrap_or(base.min_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
        }
    }

    /// Overlay onto `base` and validate the merged result.
    pub fn merge_validated(&self, base: &RateLimitConfig) -> DomainResult<RateLimitConfig> {
        let merged = self.apply_to(base);
        merged.validate()?;
        Ok(merged)
    }
}

/// Immutable job parameters, persisted with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Empty means every known district.
    #[serde(default)]
    pub target_districts: BTreeSet<String>,
    pub skip_existing: bool,
    /// Scoped to this job; survives a resume because it is part of the record.
    #[serde(default)]
    pub rate_limit_overrides: Option<RateLimitPatch>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            target_districts: BTreeSet::new(),
            skip_existing: true,
            rate_limit_overrides: None,
        }
    }
}

impl JobConfig {
    pub fn date_range(&self) -> DomainResult<DateRange> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => DateRange::new(start, end),
            _ => Err(DomainError::validation(
                "start_date and end_date are required for data-collection jobs",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistrictStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    /// Every item finished and at least one failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DistrictProgress {
    pub status: DistrictStatus,
    pub items_processed: u64,
    pub items_total: u64,
    pub last_error: Option<String>,
}

/// One entry of the per-job error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item_id: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub is_retryable: bool,
}

/// How an item ended, from the progress point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDisposition {
    Processed,
    Skipped,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_items: u64,
    /// Items whose processing finished, whatever the outcome.
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    pub current_item: Option<String>,
    #[serde(default)]
    pub district_progress: BTreeMap<String, DistrictProgress>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    /// Artifacts produced so far; carried across resumes.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl JobProgress {
    /// Fresh progress for `total_items` items; `district_totals` maps each
    /// district to the number of items that touch it.
    pub fn new(total_items: u64, district_totals: BTreeMap<String, u64>) -> Self {
        Self {
            total_items,
            district_progress: district_totals
                .into_iter()
                .map(|(district, items_total)| {
                    (
                        district,
                        DistrictProgress {
                            items_total,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn start_item(&mut self, item_id: &str, districts: &[String]) {
        self.current_item = Some(item_id.to_string());
        for district in districts {
            if let Some(d) = self.district_progress.get_mut(district) {
                if d.status == DistrictStatus::Pending {
                    d.status = DistrictStatus::InProgress;
                }
            }
        }
    }

    pub fn log_error(&mut self, item_id: &str, message: &str, is_retryable: bool, at: DateTime<Utc>) {
        self.errors.push(ItemError {
            item_id: item_id.to_string(),
            message: message.to_string(),
            occurred_at: at,
            is_retryable,
        });
    }

    pub fn finish_item(&mut self, districts: &[String], disposition: &ItemDisposition) {
        self.current_item = None;
        self.processed_items += 1;
        match disposition {
            ItemDisposition::Processed => {}
            ItemDisposition::Skipped => self.skipped_items += 1,
            ItemDisposition::Failed { .. } => self.failed_items += 1,
        }

        for district in districts {
            let Some(d) = self.district_progress.get_mut(district) else {
                continue;
            };
            d.items_processed += 1;
            if let ItemDisposition::Failed { message } = disposition {
                d.last_error = Some(message.clone());
            }
            if d.items_processed >= d.items_total {
                d.status = if d.last_error.is_some() {
                    DistrictStatus::Failed
                } else {
                    DistrictStatus::Completed
                };
            }
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        (self.processed_items as f64 / self.total_items as f64) * 100.0
    }
}

/// Resume cursor for a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_processed_item: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items_completed: BTreeSet<String>,
}

impl Checkpoint {
    pub fn record(&mut self, item_id: &str, at: DateTime<Utc>) {
        self.last_processed_item = Some(item_id.to_string());
        self.last_processed_at = Some(at);
        self.items_completed.insert(item_id.to_string());
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.items_completed.contains(item_id)
    }
}

/// Outcome summary of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub items_processed: u64,
    pub items_failed: u64,
    pub items_skipped: u64,
    /// Identifiers of artifacts (snapshots, analytics files) produced.
    pub artifacts: Vec<String>,
    pub duration_ms: u64,
}

/// A backfill job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub config: JobConfig,
    pub progress: JobProgress,
    pub checkpoint: Option<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

impl BackfillJob {
    /// Create a new pending job.
    pub fn new(job_type: JobType, config: JobConfig) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Pending,
            config,
            progress: JobProgress::default(),
            checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            resumed_at: None,
            result: None,
            error: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    /// Enter `running`. First start sets `started_at`, a resume sets `resumed_at`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        } else if self.resumed_at.is_none() {
            self.resumed_at = Some(now);
        }
        Ok(())
    }

    pub fn mark_recovering(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Recovering)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        let duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.progress.current_item = None;
        self.completed_at = Some(now);
        self.result = Some(JobResult {
            items_processed: self.progress.processed_items,
            items_failed: self.progress.failed_items,
            items_skipped: self.progress.skipped_items,
            artifacts: self.progress.artifacts.clone(),
            duration_ms,
        });
        Ok(())
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.progress.current_item = None;
        self.completed_at = Some(now);
        self.error = Some(error.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.progress.current_item = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Average wall time of a non-skipped item, for completed jobs.
    pub fn average_item_ms(&self) -> Option<f64> {
        let result = self.result.as_ref()?;
        let worked = result.items_processed.saturating_sub(result.items_skipped);
        if worked == 0 {
            return None;
        }
        Some(result.duration_ms as f64 / worked as f64)
    }
}

/// Retry policy for persistence writes.
///
/// Exponential: `base_delay * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
