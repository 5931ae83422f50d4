//! Job creation requests and their validation.
//!
//! `create_job` and `preview_job` share [`validate_request`], so a preview is
//! rejected for exactly the inputs a real job would be.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use statsboard_core::{DateRange, DomainError, DomainResult, parse_iso_date};

use super::types::{JobConfig, JobType, RateLimitConfig, RateLimitPatch};

/// Unvalidated job request as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub target_districts: Option<Vec<String>>,
    #[serde(default)]
    pub skip_existing: Option<bool>,
    #[serde(default)]
    pub rate_limit_overrides: Option<RateLimitPatch>,
}

impl CreateJobRequest {
    pub fn data_collection(start_date: &str, end_date: &str) -> Self {
        Self {
            job_type: JobType::DataCollection.as_str().to_string(),
            start_date: Some(start_date.to_string()),
            end_date: Some(end_date.to_string()),
            ..Default::default()
        }
    }

    pub fn analytics_generation() -> Self {
        Self {
            job_type: JobType::AnalyticsGeneration.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn with_districts<I, S>(mut self, districts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_districts = Some(districts.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_skip_existing(mut self, skip_existing: bool) -> Self {
        self.skip_existing = Some(skip_existing);
        self
    }

    pub fn with_rate_limit_overrides(mut self, overrides: RateLimitPatch) -> Self {
        self.rate_limit_overrides = Some(overrides);
        self
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub job_type: JobType,
    pub config: JobConfig,
}

/// Validate `request` against today's date and the current global limits.
///
/// Data-collection jobs need `start_date <= end_date < today`; analytics jobs
/// ignore the dates. District ids must be non-blank and are de-duplicated.
/// Overrides are checked merged over `global`; an empty patch is dropped.
pub fn validate_request(
    request: &CreateJobRequest,
    today: NaiveDate,
    global: &RateLimitConfig,
) -> DomainResult<ValidatedRequest> {
    let job_type: JobType = request.job_type.trim().parse()?;

    let (start_date, end_date) = match job_type {
        JobType::DataCollection => {
            let start = required_date("start_date", request.start_date.as_deref())?;
            let end = required_date("end_date", request.end_date.as_deref())?;
            DateRange::new(start, end)?;
            if end >= today {
                return Err(DomainError::validation(format!(
                    "end_date must be before today ({today})"
                )));
            }
            (Some(start), Some(end))
        }
        JobType::AnalyticsGeneration => (None, None),
    };

    let mut target_districts = BTreeSet::new();
    for district in request.target_districts.iter().flatten() {
        let district = district.trim();
        if district.is_empty() {
            return Err(DomainError::validation("target_districts must not contain blank ids"));
        }
        target_districts.insert(district.to_string());
    }

    let rate_limit_overrides = match &request.rate_limit_overrides {
        Some(patch) if !patch.is_empty() => {
            patch.merge_validated(global)?;
            Some(patch.clone())
        }
        _ => None,
    };

    Ok(ValidatedRequest {
        job_type,
        config: JobConfig {
            start_date,
            end_date,
            target_districts,
            skip_existing: request.skip_existing.unwrap_or(true),
            rate_limit_overrides,
        },
    })
}

fn required_date(field: &str, value: Option<&str>) -> DomainResult<NaiveDate> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => parse_iso_date(field, v),
        _ => Err(DomainError::validation(format!(
            "{field} is required for data-collection jobs"
        ))),
    }
}
