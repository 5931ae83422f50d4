//! Backfill job orchestration.
//!
//! ## Components
//!
//! - `JobStore` / `CheckpointStore`: durable job records and resume cursors
//!   (in-memory and JSON-file backends)
//! - `RateLimiter`: rolling-window, concurrency and backoff gating, with the
//!   window shared across a service's jobs
//! - `ItemCatalog` / `ItemProcessor`: injected collaborators that plan and
//!   perform the per-item work
//! - `JobExecutor`: drives one job through its items
//! - `UnifiedBackfillService`: admission, cancellation, listing, previews and
//!   live rate-limit configuration
//!
//! ## Lifecycle
//!
//! A job is created `pending`, moves to `running` when its executor starts and
//! ends `completed`, `failed` or `cancelled`. A process restart leaves
//! `running` jobs behind; `recover_interrupted_jobs` moves them to
//! `recovering` and resumes them from their checkpoint.

pub mod checkpoint;
pub mod estimate;
pub mod executor;
pub mod expansion;
pub mod file_store;
pub mod processor;
pub mod rate_limiter;
pub mod request;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
pub use executor::{ExecutionError, ExecutorSettings, JobExecutor};
pub use expansion::{CatalogError, ExpandedItems, ItemCatalog, WorkItem, WorkItemKind, expand_items};
pub use file_store::{FileCheckpointStore, FileJobStore};
pub use processor::{ItemContext, ItemOutcome, ItemProcessor, ProcessorSet};
pub use rate_limiter::{
    RateLimitWindow, RateLimiter, RateLimiterStats, RatePermit, SharedRateLimitConfig,
};
pub use request::{CreateJobRequest, ValidatedRequest, validate_request};
pub use service::{BackfillError, JobPage, JobPreview, PreviewAction, PreviewItem, UnifiedBackfillService};
pub use store::{InMemoryJobStore, JobFilter, JobStore, StoreError};
pub use types::{
    BackfillJob, Checkpoint, DistrictProgress, DistrictStatus, ItemError, JobConfig, JobProgress,
    JobResult, JobStatus, JobType, RateLimitConfig, RateLimitPatch, RetryPolicy,
};
