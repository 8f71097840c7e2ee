//! Continuous sliding window admission.
//!
//! Each key owns the ordered timestamps of its admitted requests within the
//! trailing window. The purge-count-append sequence runs under the map's
//! per-entry guard, so concurrent checks on the same key are linearized
//! while unrelated keys proceed on other shards. The count in any trailing
//! interval of the window length never exceeds the limit; this is the exact
//! timestamp-list formulation, not an approximation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use super::identity::ClientKey;

/// Outcome of a window admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowVerdict {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Quota left in the window after this check
    pub remaining: u64,
    /// How long until a slot frees up, zero when allowed
    pub retry_after: Duration,
}

/// Per-key window state.
struct KeyState {
    /// Admission timestamps within the trailing window, oldest first
    hits: VecDeque<Instant>,
    /// Most recent check for this key, admitted or not
    last_seen: Instant,
}

/// Keyed continuous-window store.
///
/// The limit is a check parameter rather than a field so the same structure
/// serves both the static per-client quota and the adaptive limiter's
/// dynamic quota.
pub(crate) struct SlidingWindow {
    window: Duration,
    entries: DashMap<ClientKey, KeyState>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    /// Purge, count, and append for one key, atomically for that key.
    pub fn check(&self, key: &ClientKey, limit: u64, now: Instant) -> WindowVerdict {
        let mut state = self.entries.entry(key.clone()).or_insert_with(|| KeyState {
            hits: VecDeque::new(),
            last_seen: now,
        });
        state.last_seen = now;

        // None while the process is younger than the window; nothing can be
        // stale in that case.
        if let Some(cutoff) = now.checked_sub(self.window) {
            while state.hits.front().is_some_and(|&t| t < cutoff) {
                state.hits.pop_front();
            }
        }

        if (state.hits.len() as u64) < limit {
            state.hits.push_back(now);
            WindowVerdict {
                allowed: true,
                remaining: limit - state.hits.len() as u64,
                retry_after: Duration::ZERO,
            }
        } else {
            let retry_after = match state.hits.front() {
                Some(&oldest) => self
                    .window
                    .saturating_sub(now.saturating_duration_since(oldest)),
                // limit of zero admits nothing; a full window must pass
                None => self.window,
            };
            trace!(key = %key, limit, "window quota exhausted");
            WindowVerdict {
                allowed: false,
                remaining: 0,
                retry_after,
            }
        }
    }

    /// Remove keys whose most recent activity is older than `ttl`.
    ///
    /// Keys are snapshotted first and removed one at a time, so admission
    /// checks are never stalled behind a whole-map lock for the sweep.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        let keys: Vec<ClientKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            let evicted = self
                .entries
                .remove_if(&key, |_, state| {
                    now.saturating_duration_since(state.last_seen) >= ttl
                })
                .is_some();
            if evicted {
                removed += 1;
            }
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Per-client admission against a fixed trailing-window quota.
pub(crate) struct SlidingWindowLimiter {
    limit: u64,
    window: SlidingWindow,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window: SlidingWindow::new(window),
        }
    }

    pub fn check(&self, key: &ClientKey, now: Instant) -> WindowVerdict {
        self.window.check(key, self.limit, now)
    }

    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        self.window.evict_idle(now, ttl)
    }

    pub fn tracked_keys(&self) -> usize {
        self.window.tracked_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_admits_up_to_limit_then_rejects() {
        let limiter = SlidingWindowLimiter::new(60, WINDOW);
        let key = ClientKey::from("203.0.113.7");
        let now = Instant::now();

        let mut allowed = 0;
        let mut rejected = 0;
        let mut last = WindowVerdict {
            allowed: true,
            remaining: 0,
            retry_after: Duration::ZERO,
        };
        for _ in 0..61 {
            let verdict = limiter.check(&key, now);
            if verdict.allowed {
                allowed += 1;
            } else {
                rejected += 1;
                last = verdict;
            }
        }

        assert_eq!(allowed, 60);
        assert_eq!(rejected, 1);
        assert_eq!(last.remaining, 0);
        // all hits landed at the same instant, so a full window must pass
        assert_eq!(last.retry_after, WINDOW);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(2, WINDOW);
        let key = ClientKey::from("198.51.100.4");
        let base = Instant::now();

        assert!(limiter.check(&key, base).allowed);
        assert!(limiter.check(&key, base + Duration::from_secs(30)).allowed);
        assert!(!limiter.check(&key, base + Duration::from_secs(45)).allowed);

        // first hit has aged out 61s in
        let verdict = limiter.check(&key, base + Duration::from_secs(61));
        assert!(verdict.allowed);
    }

    #[test]
    fn test_retry_after_tracks_oldest_entry() {
        let limiter = SlidingWindowLimiter::new(1, WINDOW);
        let key = ClientKey::from("198.51.100.4");
        let base = Instant::now();

        assert!(limiter.check(&key, base).allowed);
        let verdict = limiter.check(&key, base + Duration::from_secs(20));
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, Duration::from_secs(40));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, WINDOW);
        let now = Instant::now();

        assert!(limiter.check(&ClientKey::from("a"), now).allowed);
        assert!(limiter.check(&ClientKey::from("b"), now).allowed);
        assert!(!limiter.check(&ClientKey::from("a"), now).allowed);
    }

    #[test]
    fn test_zero_limit_rejects_with_full_window_retry() {
        let window = SlidingWindow::new(WINDOW);
        let verdict = window.check(&ClientKey::from("a"), 0, Instant::now());
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, WINDOW);
    }

    #[test]
    fn test_concurrent_checks_never_overshoot() {
        let limiter = Arc::new(SlidingWindowLimiter::new(60, WINDOW));
        let key = ClientKey::from("203.0.113.7");
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let key = key.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0u64;
                    for _ in 0..20 {
                        if limiter.check(&key, now).allowed {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn test_evict_idle_removes_only_stale_keys() {
        let limiter = SlidingWindowLimiter::new(10, WINDOW);
        let base = Instant::now();
        let ttl = Duration::from_secs(120);

        limiter.check(&ClientKey::from("stale"), base);
        limiter.check(&ClientKey::from("fresh"), base + Duration::from_secs(100));
        assert_eq!(limiter.tracked_keys(), 2);

        let removed = limiter.evict_idle(base + Duration::from_secs(130), ttl);
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_map_size_bounded_under_one_shot_keys() {
        let limiter = SlidingWindowLimiter::new(10, WINDOW);
        let base = Instant::now();
        let ttl = Duration::from_secs(120);

        for i in 0..1000 {
            limiter.check(&ClientKey::new(format!("client-{i}")), base);
        }
        assert_eq!(limiter.tracked_keys(), 1000);

        limiter.evict_idle(base + Duration::from_secs(121), ttl);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
