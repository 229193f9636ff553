//! Rolling-window rate limiting
//!
//! A `RateLimiter` guards one quota dimension with an ordered list of
//! windows. Every window keeps its own counter per partition key (an IP
//! address, an account name); a check is admitted only when it fits in
//! every window of the set.
//!
//! Two limiter instances are configured at startup:
//! - `requests`: per-IP request counts over {1 min, 1 hr, 1 day}
//! - `data`: per-account upload megabytes over {1 min, 1 hr, 1 day, 1 week}
//!
//! Counters are process-local and in-memory. Losing them on restart is an
//! accepted availability/abuse tradeoff, not a correctness concern; a
//! multi-process deployment needs a shared counter store instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// One rolling quota: at most `max` weight per `duration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateWindow {
    pub duration: Duration,
    pub max: f64,
}

impl RateWindow {
    pub const fn new(duration: Duration, max: f64) -> Self {
        Self { duration, max }
    }
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}s", self.max, self.duration.as_secs())
    }
}

/// A denied check, carrying the window that tripped.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimited {
    pub set: String,
    pub key: String,
    pub window: RateWindow,
}

impl std::fmt::Display for RateLimited {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} quota exhausted for {} (window {})",
            self.set, self.key, self.window
        )
    }
}

impl std::error::Error for RateLimited {}

/// Per-window counter for one partition key.
///
/// The bucket advances monotonically: once `duration` has elapsed since
/// `bucket_start`, the count resets and the bucket restarts at the time of
/// the next check.
#[derive(Debug, Clone, Copy)]
struct Counter {
    bucket_start: Instant,
    count: f64,
}

/// Rolling-window rate limiter for one quota dimension.
pub struct RateLimiter {
    name: String,
    windows: Vec<RateWindow>,
    /// Partition key -> one counter per window, parallel to `windows`.
    counters: Mutex<HashMap<String, Vec<Counter>>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, windows: Vec<RateWindow>) -> Self {
        Self {
            name: name.into(),
            windows,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn windows(&self) -> &[RateWindow] {
        &self.windows
    }

    /// Admit or deny `weight` for `key`.
    ///
    /// Windows are evaluated in declared order and the check short-circuits
    /// on the first window that would overflow. A denied check consumes no
    /// quota in any window; an admitted check increments all of them. The
    /// whole evaluation runs under one lock, so concurrent checks for the
    /// same key cannot both slip past a boundary.
    pub async fn check(&self, key: &str, weight: f64) -> Result<(), RateLimited> {
        self.check_at(key, weight, Instant::now()).await
    }

    pub(crate) async fn check_at(
        &self,
        key: &str,
        weight: f64,
        now: Instant,
    ) -> Result<(), RateLimited> {
        let mut counters = self.counters.lock().await;

        // First pass: would any window overflow?
        let slots = counters.get(key);
        for (idx, window) in self.windows.iter().enumerate() {
            let current = slots
                .and_then(|s| s.get(idx))
                .map(|c| {
                    if now.duration_since(c.bucket_start) >= window.duration {
                        0.0
                    } else {
                        c.count
                    }
                })
                .unwrap_or(0.0);

            if current + weight > window.max {
                debug!(
                    set = %self.name,
                    key = %key,
                    window = %window,
                    current = current,
                    weight = weight,
                    "Rate limit denied"
                );
                return Err(RateLimited {
                    set: self.name.clone(),
                    key: key.to_string(),
                    window: *window,
                });
            }
        }

        // Second pass: all windows fit, consume quota in each.
        let slots = counters.entry(key.to_string()).or_insert_with(|| {
            self.windows
                .iter()
                .map(|_| Counter {
                    bucket_start: now,
                    count: 0.0,
                })
                .collect()
        });
        for (idx, window) in self.windows.iter().enumerate() {
            let counter = &mut slots[idx];
            if now.duration_since(counter.bucket_start) >= window.duration {
                counter.bucket_start = now;
                counter.count = 0.0;
            }
            counter.count += weight;
        }

        Ok(())
    }

    /// Number of partition keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.counters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute_window(max: f64) -> Vec<RateWindow> {
        vec![RateWindow::new(Duration::from_secs(60), max)]
    }

    #[tokio::test]
    async fn test_admits_up_to_max_then_denies() {
        let limiter = RateLimiter::new("requests", minute_window(5.0));
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("10.0.0.1", 1.0, now).await.is_ok());
        }
        let denied = limiter.check_at("10.0.0.1", 1.0, now).await.unwrap_err();
        assert_eq!(denied.key, "10.0.0.1");
        assert_eq!(denied.window.max, 5.0);
    }

    #[tokio::test]
    async fn test_denied_check_consumes_no_quota() {
        let limiter = RateLimiter::new("data", minute_window(10.0));
        let now = Instant::now();

        assert!(limiter.check_at("alice", 8.0, now).await.is_ok());
        // 8 + 5 > 10: denied, and the 5 must not be counted.
        assert!(limiter.check_at("alice", 5.0, now).await.is_err());
        // 8 + 2 = 10 still fits, proving the denied 5 was never added.
        assert!(limiter.check_at("alice", 2.0, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_window_elapses_and_resets() {
        let limiter = RateLimiter::new("requests", minute_window(5.0));
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("10.0.0.1", 1.0, start).await.is_ok());
        }
        assert!(limiter.check_at("10.0.0.1", 1.0, start).await.is_err());

        let later = start + Duration::from_secs(61);
        assert!(limiter.check_at("10.0.0.1", 1.0, later).await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_keys_are_independent() {
        let limiter = RateLimiter::new("requests", minute_window(1.0));
        let now = Instant::now();

        assert!(limiter.check_at("10.0.0.1", 1.0, now).await.is_ok());
        assert!(limiter.check_at("10.0.0.1", 1.0, now).await.is_err());
        assert!(limiter.check_at("10.0.0.2", 1.0, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_tightest_window_trips_first_in_declared_order() {
        let limiter = RateLimiter::new(
            "requests",
            vec![
                RateWindow::new(Duration::from_secs(60), 2.0),
                RateWindow::new(Duration::from_secs(3600), 100.0),
            ],
        );
        let now = Instant::now();

        assert!(limiter.check_at("10.0.0.1", 1.0, now).await.is_ok());
        assert!(limiter.check_at("10.0.0.1", 1.0, now).await.is_ok());
        let denied = limiter.check_at("10.0.0.1", 1.0, now).await.unwrap_err();
        assert_eq!(denied.window.duration, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_fractional_weights() {
        let limiter = RateLimiter::new("data", minute_window(1.0));
        let now = Instant::now();

        assert!(limiter.check_at("alice", 0.5, now).await.is_ok());
        assert!(limiter.check_at("alice", 0.5, now).await.is_ok());
        assert!(limiter.check_at("alice", 0.1, now).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_weight_always_denied() {
        let limiter = RateLimiter::new("data", minute_window(10.0));
        let now = Instant::now();

        assert!(limiter.check_at("alice", 11.0, now).await.is_err());
        // And it left no residue behind.
        assert!(limiter.check_at("alice", 10.0, now).await.is_ok());
    }
}
