//! `statsboard-infra`: backfill orchestration for the statistics dashboard.
//!
//! Schedules, executes, checkpoints, rate-limits and cancels long-running
//! data-collection and analytics-generation jobs.

pub mod backfill;
pub mod config;

pub use config::BackfillSettings;
