//! Composition of the three throttling layers into one decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::GatewardConfig;
use crate::error::Result;

use super::adaptive::{AdaptiveLimiter, Outcome, OutcomeGuard};
use super::bucket::TokenBucket;
use super::identity::{ClientKey, ClientKeyExtractor};
use super::window::SlidingWindowLimiter;

/// Which layer rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedBy {
    /// Not blocked
    None,
    /// The global token bucket
    GlobalBucket,
    /// The per-client sliding window
    PerClient,
    /// The adaptive limiter for an expensive category
    Adaptive,
}

/// The admission decision for one request, produced and consumed per
/// request and never stored. All fields are always populated;
/// `retry_after` and `remaining` are never negative.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The layer that rejected, [`BlockedBy::None`] when allowed
    pub blocked_by: BlockedBy,
    /// How long the client should wait before retrying
    pub retry_after: Duration,
    /// Remaining quota in the tightest per-client layer consulted
    pub remaining: u64,
}

impl Decision {
    fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            blocked_by: BlockedBy::None,
            retry_after: Duration::ZERO,
            remaining,
        }
    }

    fn blocked(by: BlockedBy, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            blocked_by: by,
            retry_after,
            remaining: 0,
        }
    }

    /// Retry delay in seconds, for building transport-level retry signals.
    pub fn retry_after_secs(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }
}

/// Composes the global bucket, per-client window and adaptive limiter into
/// a single admission check.
///
/// Evaluation short-circuits on the first rejection: the global bucket is
/// cheapest and guards total load, the per-client window then enforces
/// fairness before any adaptive budget is spent, and only expensive
/// categories reach the adaptive layer at all.
pub struct RateLimitCoordinator {
    config: GatewardConfig,
    bucket: TokenBucket,
    window: SlidingWindowLimiter,
    adaptive: Arc<AdaptiveLimiter>,
}

impl RateLimitCoordinator {
    /// Create a coordinator, validating the configuration first.
    pub fn new(config: GatewardConfig) -> Result<Self> {
        config.validate()?;
        let now = Instant::now();
        let bucket = TokenBucket::new(config.global.capacity, config.global.refill_rate, now);
        let window = SlidingWindowLimiter::new(
            config.per_client.effective_limit(),
            config.per_client.window(),
        );
        let adaptive = Arc::new(AdaptiveLimiter::new(config.adaptive.clone()));
        Ok(Self {
            config,
            bucket,
            window,
            adaptive,
        })
    }

    /// Evaluate all applicable layers for one request.
    pub fn check(&self, key: &ClientKey, category: &str, now: Instant) -> Decision {
        if !self.config.enabled {
            return Decision::allowed(self.config.per_client.effective_limit());
        }

        let bucket = self.bucket.check(now);
        if !bucket.allowed {
            debug!(key = %key, category, "rejected by global token bucket");
            return Decision::blocked(BlockedBy::GlobalBucket, bucket.retry_after);
        }

        let window = self.window.check(key, now);
        if !window.allowed {
            debug!(key = %key, category, "rejected by per-client window");
            return Decision::blocked(BlockedBy::PerClient, window.retry_after);
        }

        if self.is_expensive(category) {
            let adaptive = self.adaptive.check(category, key, now);
            if !adaptive.allowed {
                debug!(key = %key, category, "rejected by adaptive limiter");
                return Decision::blocked(BlockedBy::Adaptive, adaptive.retry_after);
            }
            return Decision::allowed(window.remaining.min(adaptive.remaining));
        }

        Decision::allowed(window.remaining)
    }

    /// Obtain the outcome guard for an admitted expensive call.
    ///
    /// Returns `None` for categories outside the adaptive layer. The caller
    /// holds the guard across the backend call; see [`OutcomeGuard`] for the
    /// reporting contract.
    pub fn outcome_guard(&self, category: &str) -> Option<OutcomeGuard> {
        if self.is_expensive(category) {
            Some(OutcomeGuard::new(
                Arc::clone(&self.adaptive),
                category.to_string(),
            ))
        } else {
            None
        }
    }

    fn is_expensive(&self, category: &str) -> bool {
        self.config.expensive_categories.contains(category)
    }

    /// Report the outcome of a completed expensive call directly.
    ///
    /// Prefer [`outcome_guard`](Self::outcome_guard), which guarantees a
    /// report on every exit path; this entry point is for callers that
    /// manage their own reporting. Outcomes for categories outside the
    /// adaptive layer are ignored.
    pub fn report_outcome(&self, category: &str, outcome: Outcome) {
        if self.is_expensive(category) {
            self.adaptive.report(category, outcome, Instant::now());
        }
    }

    /// The key extractor matching this coordinator's identity settings.
    pub fn key_extractor(&self) -> ClientKeyExtractor {
        ClientKeyExtractor::new(self.config.identity.trust_proxy_headers)
    }

    /// Remove idle per-client state everywhere. Returns entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.config.eviction.ttl();
        self.window.evict_idle(now, ttl) + self.adaptive.evict_idle(now, ttl)
    }

    /// Sweep cadence, used by the background sweeper.
    pub(crate) fn sweep_interval(&self) -> Duration {
        self.config.eviction.sweep_interval()
    }

    /// Per-client entries currently tracked across all layers.
    pub fn tracked_clients(&self) -> usize {
        self.window.tracked_keys() + self.adaptive.tracked_keys()
    }

    /// Tokens currently available in the global bucket.
    pub fn global_tokens_available(&self) -> f64 {
        self.bucket.available()
    }

    /// Current dynamic limit for an expensive category, if it has state.
    pub fn current_adaptive_limit(&self, category: &str) -> Option<u64> {
        self.adaptive.current_limit(category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPENSIVE: &str = "inference";

    fn coordinator(mutate: impl FnOnce(&mut GatewardConfig)) -> RateLimitCoordinator {
        let mut config = GatewardConfig::default();
        mutate(&mut config);
        RateLimitCoordinator::new(config).unwrap()
    }

    fn key() -> ClientKey {
        ClientKey::from("203.0.113.7")
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let mut config = GatewardConfig::default();
        config.adaptive.min_limit = 50;
        assert!(RateLimitCoordinator::new(config).is_err());
    }

    #[test]
    fn test_general_request_allowed_with_remaining() {
        let coordinator = coordinator(|_| {});
        let decision = coordinator.check(&key(), "general", Instant::now());

        assert!(decision.allowed);
        assert_eq!(decision.blocked_by, BlockedBy::None);
        assert_eq!(decision.retry_after, Duration::ZERO);
        assert_eq!(decision.remaining, 69);
    }

    #[test]
    fn test_global_bucket_checked_first() {
        // tiny global bucket, generous per-client quota: exhaust the bucket
        // so both layers would reject, then confirm the global layer is the
        // one reported
        let coordinator = coordinator(|c| {
            c.global.capacity = 2.0;
            c.global.refill_rate = 0.1;
            c.per_client.requests_per_minute = 1;
            c.per_client.burst_size = 0;
        });
        let now = Instant::now();

        assert!(coordinator.check(&key(), "general", now).allowed);
        // second check: bucket has a token, window rejects
        let decision = coordinator.check(&key(), "general", now);
        assert_eq!(decision.blocked_by, BlockedBy::PerClient);
        // third check: bucket is empty too, and it wins
        let decision = coordinator.check(&key(), "general", now);
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_by, BlockedBy::GlobalBucket);
        assert!(decision.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_per_client_rejection_reports_retry() {
        let coordinator = coordinator(|c| {
            c.per_client.requests_per_minute = 2;
            c.per_client.burst_size = 0;
        });
        let now = Instant::now();

        assert!(coordinator.check(&key(), "general", now).allowed);
        assert!(coordinator.check(&key(), "general", now).allowed);
        let decision = coordinator.check(&key(), "general", now);
        assert_eq!(decision.blocked_by, BlockedBy::PerClient);
        assert_eq!(decision.retry_after, Duration::from_secs(60));
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_expensive_category_hits_adaptive_layer() {
        let coordinator = coordinator(|_| {});
        let now = Instant::now();

        // adaptive base limit (10) is tighter than the per-client quota (70)
        let mut allowed = 0;
        for _ in 0..15 {
            let decision = coordinator.check(&key(), EXPENSIVE, now);
            if decision.allowed {
                allowed += 1;
            } else {
                assert_eq!(decision.blocked_by, BlockedBy::Adaptive);
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_general_category_skips_adaptive_layer() {
        let coordinator = coordinator(|_| {});
        let now = Instant::now();

        for _ in 0..15 {
            assert!(coordinator.check(&key(), "general", now).allowed);
        }
        // the adaptive layer never saw the category
        assert_eq!(coordinator.current_adaptive_limit("general"), None);
    }

    #[test]
    fn test_remaining_is_tightest_layer() {
        let coordinator = coordinator(|_| {});
        let now = Instant::now();

        let decision = coordinator.check(&key(), EXPENSIVE, now);
        assert!(decision.allowed);
        // 9 left in the adaptive window vs 69 in the per-client window
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn test_outcome_guard_only_for_expensive_categories() {
        let coordinator = coordinator(|_| {});
        assert!(coordinator.outcome_guard("general").is_none());
        assert!(coordinator.outcome_guard(EXPENSIVE).is_some());
    }

    #[test]
    fn test_reported_failures_tighten_admission() {
        let coordinator = coordinator(|_| {});
        let base = Instant::now();
        coordinator.check(&key(), EXPENSIVE, base);

        for _ in 0..10 {
            coordinator
                .outcome_guard(EXPENSIVE)
                .unwrap()
                .failure();
        }
        // exactly one interval later the reports are still inside the
        // trailing outcome window
        coordinator.check(&key(), EXPENSIVE, base + Duration::from_secs(30));
        let limit = coordinator.current_adaptive_limit(EXPENSIVE).unwrap();
        assert!(limit < 10);
        assert!(limit >= 5);
    }

    #[test]
    fn test_disabled_passthrough() {
        let coordinator = coordinator(|c| {
            c.enabled = false;
            c.per_client.requests_per_minute = 1;
            c.per_client.burst_size = 0;
            c.global.capacity = 1.0;
        });
        let now = Instant::now();

        for _ in 0..100 {
            let decision = coordinator.check(&key(), EXPENSIVE, now);
            assert!(decision.allowed);
        }
        assert_eq!(coordinator.tracked_clients(), 0);
    }

    #[test]
    fn test_sweep_prunes_all_layers() {
        let coordinator = coordinator(|_| {});
        let base = Instant::now();

        coordinator.check(&ClientKey::from("a"), "general", base);
        coordinator.check(&ClientKey::from("b"), EXPENSIVE, base);
        assert_eq!(coordinator.tracked_clients(), 3);

        let removed = coordinator.sweep(base + Duration::from_secs(121));
        assert_eq!(removed, 3);
        assert_eq!(coordinator.tracked_clients(), 0);
    }
}
