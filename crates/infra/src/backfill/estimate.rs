//! Duration estimates for dry-run previews.
//!
//! Per-item time is an exponentially weighted moving average of the per-item
//! averages of recent completed jobs, floored by the spacing the rate limiter
//! would enforce anyway.

use std::time::Duration;

use super::types::{BackfillJob, JobStatus, RateLimitConfig};

/// Per-item estimate when no completed job of the same type exists.
pub const DEFAULT_ITEM_MS: u64 = 2_000;

/// How many recent completed jobs feed the average.
pub const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct EtaCalculator {
    alpha: f64,
    avg_ms: f64,
    observations: u32,
}

impl Default for EtaCalculator {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl EtaCalculator {
    /// `alpha` is clamped into `0.01..=1.0`; higher values favour recent samples.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.01, 1.0),
            avg_ms: 0.0,
            observations: 0,
        }
    }

    pub fn update(&mut self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        if self.observations == 0 {
            self.avg_ms = sample_ms;
        } else {
            self.avg_ms = self.alpha * sample_ms + (1.0 - self.alpha) * self.avg_ms;
        }
        self.observations += 1;
    }

    pub fn observations(&self) -> u32 {
        self.observations
    }

    pub fn avg_ms(&self) -> Option<u64> {
        (self.observations > 0).then(|| self.avg_ms.round() as u64)
    }
}

/// Shortest time per item the limiter allows under `config`.
pub fn limiter_floor_ms(config: &RateLimitConfig) -> u64 {
    (config.window_spacing().as_millis() as u64).max(config.min_delay_ms)
}

/// Estimated per-item time given completed jobs, newest first.
pub fn per_item_ms(history: &[BackfillJob], config: &RateLimitConfig) -> u64 {
    let mut eta = EtaCalculator::default();
    // Oldest first so the newest jobs carry the most weight.
    for job in history
        .iter()
        .filter(|j| j.status == JobStatus::Completed)
        .take(HISTORY_LIMIT)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
    {
        if let Some(avg) = job.average_item_ms() {
            eta.update(avg);
        }
    }

    eta.avg_ms()
        .unwrap_or(DEFAULT_ITEM_MS)
        .max(limiter_floor_ms(config))
}

/// Estimated wall time for `items` items.
pub fn estimate_duration(items: u64, history: &[BackfillJob], config: &RateLimitConfig) -> Duration {
    Duration::from_millis(per_item_ms(history, config).saturating_mul(items))
}
