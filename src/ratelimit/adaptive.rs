//! Feedback-driven adaptive limiter for expensive operation categories.
//!
//! The backend's real capacity is observed, not configured: each category
//! carries a dynamic per-window quota that shrinks multiplicatively while
//! the reported failure ratio is high and creeps back up by a fixed step
//! after sustained health. Admission at the dynamic quota reuses the
//! continuous sliding window, keyed per client so one abusive client cannot
//! consume a whole category's budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::AdaptiveConfig;

use super::identity::ClientKey;
use super::window::{SlidingWindow, WindowVerdict};

/// Result of a guarded backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Treated identically to [`Outcome::Failure`] when adjusting
    Timeout,
}

impl Outcome {
    fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Timeout)
    }
}

/// Control state for one category: the dynamic limit and the feedback that
/// drives it. Guarded by one mutex since adjustments are rare and cheap.
struct ControlState {
    current_limit: u64,
    /// Trailing outcomes, oldest first, pruned to the adjustment interval
    outcomes: VecDeque<(Instant, Outcome)>,
    last_adjustment: Instant,
    /// Consecutive healthy intervals observed so far
    healthy_streak: u32,
}

struct CategoryState {
    control: Mutex<ControlState>,
    /// Per-client admission window at the category's dynamic limit
    window: SlidingWindow,
}

/// Per-category dynamic quota with outcome feedback.
pub(crate) struct AdaptiveLimiter {
    config: AdaptiveConfig,
    categories: DashMap<String, Arc<CategoryState>>,
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            categories: DashMap::new(),
        }
    }

    fn category(&self, category: &str, now: Instant) -> Arc<CategoryState> {
        if let Some(state) = self.categories.get(category) {
            return Arc::clone(&state);
        }
        let state = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| {
                debug!(
                    category,
                    base_limit = self.config.base_limit,
                    "creating adaptive state for category"
                );
                Arc::new(CategoryState {
                    control: Mutex::new(ControlState {
                        current_limit: self.config.base_limit,
                        outcomes: VecDeque::new(),
                        last_adjustment: now,
                        healthy_streak: 0,
                    }),
                    window: SlidingWindow::new(self.config.window()),
                })
            });
        Arc::clone(&state)
    }

    /// Check admission for `key` within `category` at the current dynamic
    /// limit, adjusting the limit first if an interval has elapsed.
    pub fn check(&self, category: &str, key: &ClientKey, now: Instant) -> WindowVerdict {
        let state = self.category(category, now);
        let limit = {
            let mut control = state.control.lock();
            self.maybe_adjust(category, &mut control, now);
            control.current_limit
        };
        state.window.check(key, limit, now)
    }

    /// Record the outcome of a completed (or abandoned) guarded call.
    pub fn report(&self, category: &str, outcome: Outcome, now: Instant) {
        let state = self.category(category, now);
        let mut control = state.control.lock();
        control.outcomes.push_back((now, outcome));
        let horizon = self.config.adjustment_interval();
        while control
            .outcomes
            .front()
            .is_some_and(|&(t, _)| now.saturating_duration_since(t) > horizon)
        {
            control.outcomes.pop_front();
        }
    }

    /// Apply the adjustment policy, at most once per adjustment interval.
    fn maybe_adjust(&self, category: &str, control: &mut ControlState, now: Instant) {
        let interval = self.config.adjustment_interval();
        if now.saturating_duration_since(control.last_adjustment) < interval {
            return;
        }

        let horizon = now.checked_sub(interval);
        if let Some(horizon) = horizon {
            while control.outcomes.front().is_some_and(|&(t, _)| t < horizon) {
                control.outcomes.pop_front();
            }
        }

        let total = control.outcomes.len();
        if total == 0 {
            // no evidence either way, leave the limit and streak alone
            control.last_adjustment = now;
            return;
        }

        let failures = control
            .outcomes
            .iter()
            .filter(|(_, o)| o.is_failure())
            .count();
        let ratio = failures as f64 / total as f64;

        if ratio > self.config.failure_threshold {
            let reduced = (control.current_limit as f64 * self.config.decrease_factor) as u64;
            let new_limit = reduced.max(self.config.min_limit);
            if new_limit != control.current_limit {
                warn!(
                    category,
                    failure_ratio = ratio,
                    old_limit = control.current_limit,
                    new_limit,
                    "backend degraded, reducing adaptive limit"
                );
                control.current_limit = new_limit;
            }
            control.healthy_streak = 0;
        } else if ratio < self.config.recovery_threshold {
            control.healthy_streak += 1;
            if control.healthy_streak >= self.config.recovery_intervals {
                let new_limit =
                    (control.current_limit + self.config.increase_step).min(self.config.max_limit);
                if new_limit != control.current_limit {
                    info!(
                        category,
                        failure_ratio = ratio,
                        old_limit = control.current_limit,
                        new_limit,
                        "backend healthy, raising adaptive limit"
                    );
                    control.current_limit = new_limit;
                }
                control.healthy_streak = 0;
            }
        } else {
            control.healthy_streak = 0;
        }

        control.last_adjustment = now;
    }

    /// The current dynamic limit for a category, if it has state.
    pub fn current_limit(&self, category: &str) -> Option<u64> {
        self.categories
            .get(category)
            .map(|s| s.control.lock().current_limit)
    }

    /// Remove idle per-client entries across all categories.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        self.categories
            .iter()
            .map(|entry| entry.window.evict_idle(now, ttl))
            .sum()
    }

    /// Per-client entries tracked across all categories.
    pub fn tracked_keys(&self) -> usize {
        self.categories
            .iter()
            .map(|entry| entry.window.tracked_keys())
            .sum()
    }
}

/// Scoped outcome reporting for an admitted expensive call.
///
/// Obtained from the coordinator before the guarded operation runs. Every
/// exit path reports: resolving with [`success`](OutcomeGuard::success),
/// [`failure`](OutcomeGuard::failure) or [`timeout`](OutcomeGuard::timeout)
/// consumes the guard, and dropping an unresolved guard reports a timeout so
/// abandoned or cancelled calls still count against backend health.
pub struct OutcomeGuard {
    limiter: Arc<AdaptiveLimiter>,
    category: String,
    resolved: bool,
}

impl OutcomeGuard {
    pub(crate) fn new(limiter: Arc<AdaptiveLimiter>, category: String) -> Self {
        Self {
            limiter,
            category,
            resolved: false,
        }
    }

    /// Report that the guarded call completed successfully.
    pub fn success(mut self) {
        self.resolve(Outcome::Success);
    }

    /// Report that the guarded call failed.
    pub fn failure(mut self) {
        self.resolve(Outcome::Failure);
    }

    /// Report that the guarded call timed out.
    pub fn timeout(mut self) {
        self.resolve(Outcome::Timeout);
    }

    fn resolve(&mut self, outcome: Outcome) {
        self.resolved = true;
        self.limiter.report(&self.category, outcome, Instant::now());
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(
                category = %self.category,
                "outcome guard dropped unresolved, recording timeout"
            );
            self.limiter
                .report(&self.category, Outcome::Timeout, Instant::now());
        }
    }
}
