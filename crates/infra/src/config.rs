//! Backfill runtime settings.
//!
//! Loaded from environment variables; anything missing or unparsable falls
//! back to its default with a warning instead of aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::backfill::types::{RateLimitConfig, RetryPolicy};

pub const ENV_DATA_DIR: &str = "STATSBOARD_DATA_DIR";
pub const ENV_RATE_LIMIT_RPM: &str = "STATSBOARD_RATE_LIMIT_RPM";
pub const ENV_RATE_LIMIT_CONCURRENT: &str = "STATSBOARD_RATE_LIMIT_CONCURRENT";
pub const ENV_RATE_LIMIT_MIN_DELAY_MS: &str = "STATSBOARD_RATE_LIMIT_MIN_DELAY_MS";
pub const ENV_RATE_LIMIT_MAX_DELAY_MS: &str = "STATSBOARD_RATE_LIMIT_MAX_DELAY_MS";
pub const ENV_RATE_LIMIT_BACKOFF: &str = "STATSBOARD_RATE_LIMIT_BACKOFF";
pub const ENV_MAX_ITEM_ATTEMPTS: &str = "STATSBOARD_MAX_ITEM_ATTEMPTS";
pub const ENV_CANCEL_TIMEOUT_SECS: &str = "STATSBOARD_CANCEL_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSettings {
    /// Root of the file-backed job and checkpoint stores.
    pub data_dir: PathBuf,
    /// Initial global rate limit; adjustable at runtime.
    pub rate_limit: RateLimitConfig,
    /// Attempts per item for retryable failures, including the first.
    pub max_item_attempts: u32,
    /// How long `cancel_job` waits for the executor to confirm.
    pub cancel_confirm_timeout: Duration,
    /// Retry policy for job and checkpoint writes.
    pub persist_retry: RetryPolicy,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/backfill"),
            rate_limit: RateLimitConfig::default(),
            max_item_attempts: 3,
            cancel_confirm_timeout: Duration::from_secs(30),
            persist_retry: RetryPolicy::default(),
        }
    }
}

impl BackfillSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let data_dir = lookup(ENV_DATA_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let base = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            max_requests_per_minute: parse_or(
                &lookup,
                ENV_RATE_LIMIT_RPM,
                base.max_requests_per_minute,
            ),
            max_concurrent: parse_or(&lookup, ENV_RATE_LIMIT_CONCURRENT, base.max_concurrent),
            min_delay_ms: parse_or(&lookup, ENV_RATE_LIMIT_MIN_DELAY_MS, base.min_delay_ms),
            max_delay_ms: parse_or(&lookup, ENV_RATE_LIMIT_MAX_DELAY_MS, base.max_delay_ms),
            backoff_multiplier: parse_or(&lookup, ENV_RATE_LIMIT_BACKOFF, base.backoff_multiplier),
        };
        let rate_limit = match rate_limit.validate() {
            Ok(()) => rate_limit,
            Err(e) => {
                warn!(error = %e, "invalid rate limit settings, using defaults");
                base
            }
        };

        let max_item_attempts = match parse_or(&lookup, ENV_MAX_ITEM_ATTEMPTS, defaults.max_item_attempts) {
            0 => {
                warn!(key = ENV_MAX_ITEM_ATTEMPTS, "must be at least 1, using default");
                defaults.max_item_attempts
            }
            n => n,
        };

        let cancel_confirm_timeout = Duration::from_secs(parse_or(
            &lookup,
            ENV_CANCEL_TIMEOUT_SECS,
            defaults.cancel_confirm_timeout.as_secs(),
        ));

        Self {
            data_dir,
            rate_limit,
            max_item_attempts,
            cancel_confirm_timeout,
            persist_retry: defaults.persist_retry,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "unparsable setting, using default");
            default
        }
    }
}
