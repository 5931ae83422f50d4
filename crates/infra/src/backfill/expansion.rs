//! Job config → ordered work items.
//!
//! The executor and the dry-run preview both call [`expand_items`], so a
//! preview always describes exactly the items a run would visit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use statsboard_core::format_iso_date;

use super::types::{JobConfig, JobType};

/// What an item refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorkItemKind {
    /// One day of dashboard data.
    Date(NaiveDate),
    /// One stored snapshot awaiting analytics.
    Snapshot(String),
}

/// Smallest unit of work in a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier used in checkpoints and error logs.
    pub id: String,
    pub kind: WorkItemKind,
    /// Districts this item covers.
    pub districts: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("invalid job config: {0}")]
    InvalidConfig(String),
}

/// Read-only view of the data source and local storage needed to plan work.
///
/// Implemented next to the snapshot/analytics storage; the orchestrator only
/// consumes it.
#[async_trait]
pub trait ItemCatalog: Send + Sync {
    /// Every district the data source knows about.
    async fn districts(&self) -> Result<Vec<String>, CatalogError>;

    /// Ids of snapshots stored locally.
    async fn snapshot_ids(&self) -> Result<Vec<String>, CatalogError>;

    /// Whether the artifact this item would produce already exists.
    async fn item_exists(&self, job_type: JobType, item: &WorkItem) -> Result<bool, CatalogError>;
}

/// Items of one job, in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedItems {
    pub items: Vec<WorkItem>,
    /// Districts touched by at least one item, sorted.
    pub districts: Vec<String>,
}

impl ExpandedItems {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items touching each district.
    pub fn district_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for item in &self.items {
            for district in &item.districts {
                *totals.entry(district.clone()).or_insert(0) += 1;
            }
        }
        totals
    }
}

/// Expand a job config into its ordered items.
///
/// - data-collection: one item per day in `start_date..=end_date`, id `YYYY-MM-DD`.
/// - analytics-generation: one item per stored snapshot, ids sorted and de-duplicated.
///
/// Every item covers the targeted districts, or all known districts when the
/// target set is empty.
pub async fn expand_items(
    job_type: JobType,
    config: &JobConfig,
    catalog: &dyn ItemCatalog,
) -> Result<ExpandedItems, CatalogError> {
    let districts: Vec<String> = if config.target_districts.is_empty() {
        let mut all = catalog.districts().await?;
        all.sort();
        all.dedup();
        all
    } else {
        config.target_districts.iter().cloned().collect()
    };

    let items = match job_type {
        JobType::DataCollection => {
            let range = config
                .date_range()
                .map_err(|e| CatalogError::InvalidConfig(e.to_string()))?;
            range
                .days()
                .map(|day| WorkItem {
                    id: format_iso_date(day),
                    kind: WorkItemKind::Date(day),
                    districts: districts.clone(),
                })
                .collect()
        }
        JobType::AnalyticsGeneration => {
            let mut ids = catalog.snapshot_ids().await?;
            ids.sort();
            ids.dedup();
            ids.into_iter()
                .map(|id| WorkItem {
                    id: id.clone(),
                    kind: WorkItemKind::Snapshot(id),
                    districts: districts.clone(),
                })
                .collect()
        }
    };

    Ok(ExpandedItems { items, districts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::testing::StaticCatalog;
    use proptest::prelude::*;

    fn dc_config(start: &str, end: &str) -> JobConfig {
        JobConfig {
            start_date: Some(start.parse().unwrap()),
            end_date: Some(end.parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn data_collection_expands_inclusive_date_range() {
        let catalog = StaticCatalog::new(["D2", "D1"], Vec::<String>::new());
        let expanded = expand_items(
            JobType::DataCollection,
            &dc_config("2024-01-01", "2024-01-03"),
            &catalog,
        )
        .await
        .unwrap();

        let ids: Vec<_> = expanded.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        assert_eq!(expanded.districts, vec!["D1", "D2"]);
        assert_eq!(expanded.district_totals()["D1"], 3);
    }

    #[tokio::test]
    async fn target_districts_replace_catalog_districts() {
        let catalog = StaticCatalog::new(["D1", "D2", "D3"], Vec::<String>::new());
        let mut config = dc_config("2024-03-01", "2024-03-01");
        config.target_districts = ["D3".to_string()].into();

        let expanded = expand_items(JobType::DataCollection, &config, &catalog)
            .await
            .unwrap();
        assert_eq!(expanded.districts, vec!["D3"]);
        assert_eq!(expanded.items[0].districts, vec!["D3"]);
    }

    #[tokio::test]
    async fn analytics_generation_uses_sorted_unique_snapshots() {
        let catalog = StaticCatalog::new(["D1"], ["2024-01-02", "2024-01-01", "2024-01-02"]);
        let expanded = expand_items(JobType::AnalyticsGeneration, &JobConfig::default(), &catalog)
            .await
            .unwrap();

        let ids: Vec<_> = expanded.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["2024-01-01", "2024-01-02"]);
        assert!(matches!(&expanded.items[0].kind, WorkItemKind::Snapshot(s) if s == "2024-01-01"));
    }

    #[tokio::test]
    async fn data_collection_without_dates_is_invalid() {
        let catalog = StaticCatalog::new(["D1"], Vec::<String>::new());
        let err = expand_items(JobType::DataCollection, &JobConfig::default(), &catalog)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidConfig(_)));
    }

    proptest! {
        /// Property: expansion is deterministic and yields one item per day.
        #[test]
        fn expansion_is_deterministic(span in 0i64..120) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
            let end = start + chrono::Duration::days(span);
            let config = JobConfig {
                start_date: Some(start),
                end_date: Some(end),
                ..Default::default()
            };
            let catalog = StaticCatalog::new(["D1", "D2"], Vec::<String>::new());

            let first = rt.block_on(expand_items(JobType::DataCollection, &config, &catalog)).unwrap();
            let second = rt.block_on(expand_items(JobType::DataCollection, &config, &catalog)).unwrap();
            prop_assert_eq!(first.len() as i64, span + 1);
            prop_assert_eq!(first, second);
        }
    }
}
