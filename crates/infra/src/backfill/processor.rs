//! Per-item processing seam.
//!
//! The actual fetch/compute logic lives outside this crate. The executor only
//! sees [`ItemProcessor`], selected per job by its [`JobType`].

use std::sync::Arc;

use async_trait::async_trait;

use statsboard_core::JobId;

use super::expansion::WorkItem;
use super::types::JobType;

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The item was processed; `artifact_id` names what it produced, if anything.
    Success { artifact_id: Option<String> },
    /// Nothing to do for this item (e.g. the snapshot already exists).
    Skipped { reason: String },
    /// Processing failed. Non-retryable failures halt the job.
    Failed { message: String, is_retryable: bool },
}

impl ItemOutcome {
    pub fn success(artifact_id: impl Into<String>) -> Self {
        ItemOutcome::Success {
            artifact_id: Some(artifact_id.into()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        ItemOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            message: message.into(),
            is_retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            message: message.into(),
            is_retryable: false,
        }
    }
}

/// Per-call context handed to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub skip_existing: bool,
    /// 1-based attempt number for this item.
    pub attempt: u32,
}

#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &WorkItem, ctx: &ItemContext) -> ItemOutcome;
}

#[async_trait]
impl<P> ItemProcessor for Arc<P>
where
    P: ItemProcessor + ?Sized,
{
    async fn process(&self, item: &WorkItem, ctx: &ItemContext) -> ItemOutcome {
        (**self).process(item, ctx).await
    }
}

/// One processor per job type.
#[derive(Clone)]
pub struct ProcessorSet {
    data_collection: Arc<dyn ItemProcessor>,
    analytics_generation: Arc<dyn ItemProcessor>,
}

impl std::fmt::Debug for ProcessorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorSet").finish_non_exhaustive()
    }
}

impl ProcessorSet {
    pub fn new(
        data_collection: Arc<dyn ItemProcessor>,
        analytics_generation: Arc<dyn ItemProcessor>,
    ) -> Self {
        Self {
            data_collection,
            analytics_generation,
        }
    }

    pub fn for_job_type(&self, job_type: JobType) -> Arc<dyn ItemProcessor> {
        match job_type {
            JobType::DataCollection => self.data_collection.clone(),
            JobType::AnalyticsGeneration => self.analytics_generation.clone(),
        }
    }
}
