//! Outbound rate limiting for item processing.
//!
//! Three constraints gate every permit:
//! - **Rolling window**: at most `max_requests_per_minute` grants in any 60 s window.
//! - **Concurrency**: at most `max_concurrent` permits outstanding.
//! - **Spacing**: consecutive grants are at least the current backoff delay apart.
//!   The delay starts at `min_delay_ms`, is multiplied by `backoff_multiplier`
//!   (capped at `max_delay_ms`) on each reported failure and resets on success.
//!
//! Over-limit acquisitions wait rather than fail. Configuration is re-read on
//! every acquisition, so [`SharedRateLimitConfig::update`] takes effect for
//! running jobs without a restart.
//!
//! Grant history, permits and backoff live in a [`RateLimitWindow`]. The
//! service hands one window to every job's limiter, so consecutive jobs draw
//! on the same budget against the external source.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use statsboard_core::DomainResult;

use super::types::{RateLimitConfig, RateLimitPatch};

const WINDOW: Duration = Duration::from_secs(60);

struct SharedInner {
    config: RwLock<RateLimitConfig>,
    changed: Notify,
}

/// Process-wide rate limit configuration, owned by the backfill service.
#[derive(Clone)]
pub struct SharedRateLimitConfig {
    inner: Arc<SharedInner>,
}

impl std::fmt::Debug for SharedRateLimitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedRateLimitConfig").field(&self.get()).finish()
    }
}

impl SharedRateLimitConfig {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                config: RwLock::new(config),
                changed: Notify::new(),
            }),
        }
    }

    pub fn get(&self) -> RateLimitConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `patch`, validate the result and publish it. On error the active
    /// config is left untouched.
    pub fn update(&self, patch: &RateLimitPatch) -> DomainResult<RateLimitConfig> {
        let updated = {
            let mut config = self
                .inner
                .config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let merged = patch.merge_validated(&config)?;
            *config = merged.clone();
            merged
        };
        self.inner.changed.notify_waiters();
        Ok(updated)
    }

    fn changed(&self) -> tokio::sync::futures::Notified<'_> {
        self.inner.changed.notified()
    }
}

impl Default for SharedRateLimitConfig {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Point-in-time limiter counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub in_flight: u32,
    pub granted_last_minute: usize,
    pub current_delay_ms: u64,
}

#[derive(Debug)]
struct WindowState {
    grants: VecDeque<Instant>,
    in_flight: u32,
    current_delay_ms: u64,
    last_grant: Option<Instant>,
}

enum Wait {
    Release,
    Until(Instant),
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.grants.front() {
            if now.duration_since(*oldest) >= WINDOW {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn clamp_delay(&mut self, config: &RateLimitConfig) {
        self.current_delay_ms = self
            .current_delay_ms
            .clamp(config.min_delay_ms, config.max_delay_ms);
    }

    fn try_grant(&mut self, now: Instant, config: &RateLimitConfig) -> Result<(), Wait> {
        if self.in_flight >= config.max_concurrent {
            return Err(Wait::Release);
        }

        let cap = config.max_requests_per_minute as usize;
        if self.grants.len() >= cap {
            // The grant that must age out before one more fits the window.
            let blocking = self.grants[self.grants.len() - cap];
            return Err(Wait::Until(blocking + WINDOW));
        }

        if let Some(last) = self.last_grant {
            let next = last + Duration::from_millis(self.current_delay_ms);
            if now < next {
                return Err(Wait::Until(next));
            }
        }

        self.in_flight += 1;
        self.grants.push_back(now);
        self.last_grant = Some(now);
        Ok(())
    }
}

#[derive(Debug)]
struct LimiterInner {
    state: Mutex<WindowState>,
    released: Notify,
}

impl LimiterInner {
    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Grant history, outstanding permits and backoff delay for one external
/// source.
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    inner: Arc<LimiterInner>,
}

impl RateLimitWindow {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(WindowState {
                    grants: VecDeque::new(),
                    in_flight: 0,
                    current_delay_ms: 0,
                    last_grant: None,
                }),
                released: Notify::new(),
            }),
        }
    }
}

impl Default for RateLimitWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while an item operation is in flight; dropping it frees the slot.
#[derive(Debug)]
pub struct RatePermit {
    inner: Arc<LimiterInner>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.inner.released.notify_waiters();
    }
}

/// Rate limiter for one job.
///
/// Overrides are scoped to this limiter; the window it draws on may be shared
/// with other jobs' limiters.
#[derive(Debug)]
pub struct RateLimiter {
    global: SharedRateLimitConfig,
    overrides: Option<RateLimitPatch>,
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Limiter with a window of its own.
    pub fn new(global: SharedRateLimitConfig, overrides: Option<RateLimitPatch>) -> Self {
        Self::with_window(global, overrides, RateLimitWindow::new())
    }

    /// Limiter drawing on `window`, whose grants and backoff carry over.
    pub fn with_window(
        global: SharedRateLimitConfig,
        overrides: Option<RateLimitPatch>,
        window: RateLimitWindow,
    ) -> Self {
        let limiter = Self {
            global,
            overrides,
            inner: window.inner,
        };
        let config = limiter.effective_config();
        limiter.inner.lock().clamp_delay(&config);
        limiter
    }

    /// Global config with this job's overrides applied.
    ///
    /// Overrides were validated against the global config at job creation; if
    /// a later global change makes the merge invalid, the global config wins.
    pub fn effective_config(&self) -> RateLimitConfig {
        let global = self.global.get();
        match &self.overrides {
            Some(patch) => match patch.merge_validated(&global) {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(error = %e, "rate limit overrides no longer valid, using global config");
                    global
                }
            },
            None => global,
        }
    }

    /// Wait until all three constraints allow one more operation.
    pub async fn acquire(&self) -> RatePermit {
        loop {
            let config = self.effective_config();
            let released = self.inner.released.notified();
            let changed = self.global.changed();

            let wait = {
                let mut state = self.inner.lock();
                let now = Instant::now();
                state.prune(now);
                state.clamp_delay(&config);
                match state.try_grant(now, &config) {
                    Ok(()) => {
                        debug!(
                            in_flight = state.in_flight,
                            granted_last_minute = state.grants.len(),
                            "rate limit permit granted"
                        );
                        return RatePermit {
                            inner: self.inner.clone(),
                        };
                    }
                    Err(wait) => wait,
                }
            };

            match wait {
                Wait::Release => {
                    tokio::select! {
                        _ = released => {}
                        _ = changed => {}
                    }
                }
                Wait::Until(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = released => {}
                        _ = changed => {}
                    }
                }
            }
        }
    }

    /// Grow the spacing delay after a failed operation.
    pub fn report_failure(&self) {
        let config = self.effective_config();
        let mut state = self.inner.lock();
        state.clamp_delay(&config);
        let grown = (state.current_delay_ms as f64 * config.backoff_multiplier).round() as u64;
        state.current_delay_ms = grown.min(config.max_delay_ms);
        debug!(delay_ms = state.current_delay_ms, "rate limit backoff increased");
    }

    /// Reset the spacing delay after a successful operation.
    pub fn report_success(&self) {
        let config = self.effective_config();
        self.inner.lock().current_delay_ms = config.min_delay_ms;
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.inner.lock();
        state.prune(Instant::now());
        RateLimiterStats {
            in_flight: state.in_flight,
            granted_last_minute: state.grants.len(),
            current_delay_ms: state.current_delay_ms,
        }
    }
}
