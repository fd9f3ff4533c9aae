//! Per-principal sliding-window rate limiting with exponential backoff.
//!
//! The principal is the tenant id when present, otherwise the client id,
//! otherwise `"anonymous"`. `allow` is O(1) under one coarse lock; the
//! lock is never held across I/O. A janitor sweeps buckets that have been
//! idle past the cleanup interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admissions allowed per window
    pub max_requests: u32,
    /// Window duration
    pub window_size: Duration,
    /// First backoff step
    pub base_backoff: Duration,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Idle buckets older than this are swept
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_size: Duration::from_secs(60),
            base_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Verdict of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request may proceed
    pub admitted: bool,
    /// How long to wait before trying again, when denied
    pub retry_after: Option<Duration>,
    /// Denial reason, when denied
    pub reason: Option<&'static str>,
}

impl Admission {
    fn granted() -> Self {
        Self {
            admitted: true,
            retry_after: None,
            reason: None,
        }
    }

    fn denied(retry_after: Duration) -> Self {
        Self {
            admitted: false,
            retry_after: Some(retry_after),
            reason: Some("rate_limit_exceeded"),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    request_count: u32,
    retry_count: u32,
    backoff_until: Option<Instant>,
    last_activity: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            retry_count: 0,
            backoff_until: None,
            last_activity: now,
        }
    }
}

/// Sliding-window limiter keyed by principal
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Create a limiter with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Admit or deny one request for the principal.
    ///
    /// Consecutive denials escalate the backoff: each denied call while a
    /// backoff is pending bumps the retry count, so `retry_after` is
    /// monotone non-decreasing up to the configured ceiling.
    pub fn allow(&self, principal: &str) -> Admission {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(principal.to_string())
            .or_insert_with(|| Bucket::new(now));
        bucket.last_activity = now;

        if let Some(until) = bucket.backoff_until {
            if now < until {
                bucket.retry_count += 1;
                let backoff = self.backoff_for(bucket.retry_count);
                bucket.backoff_until = Some(now + backoff);
                drop(buckets);
                self.record_denial(principal);
                return Admission::denied(backoff);
            }
        }

        if now.duration_since(bucket.window_start) > self.config.window_size {
            bucket.window_start = now;
            bucket.request_count = 0;
            bucket.retry_count = 0;
            bucket.backoff_until = None;
        }

        if bucket.request_count >= self.config.max_requests {
            bucket.retry_count += 1;
            let backoff = self.backoff_for(bucket.retry_count);
            bucket.backoff_until = Some(now + backoff);
            drop(buckets);
            self.record_denial(principal);
            return Admission::denied(backoff);
        }

        bucket.request_count += 1;
        Admission::granted()
    }

    /// Apply a server-supplied retry hint to the principal's bucket so the
    /// next admission honours it
    pub fn penalize(&self, principal: &str, retry_after: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(principal.to_string())
            .or_insert_with(|| Bucket::new(now));
        bucket.last_activity = now;
        let until = now + retry_after.min(self.config.max_backoff);
        if bucket.backoff_until.is_none_or(|existing| until > existing) {
            bucket.backoff_until = Some(until);
        }
        warn!(principal, ?retry_after, "applying server rate-limit hint");
    }

    /// Remove buckets idle past the cleanup interval; returns how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets
            .retain(|_, b| now.duration_since(b.last_activity) < self.config.cleanup_interval);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed, "swept idle rate-limit buckets");
        }
        removed
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Run the janitor until cancelled
    pub fn spawn_janitor(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.config.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        limiter.sweep();
                    }
                }
            }
        })
    }

    fn backoff_for(&self, retry_count: u32) -> Duration {
        let backoff = self
            .config
            .base_backoff
            .mul_f64(self.config.backoff_multiplier * f64::from(retry_count));
        backoff.min(self.config.max_backoff)
    }

    fn record_denial(&self, principal: &str) {
        counter!("rate_limit_denials_total", "principal" => principal.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn strict_config() -> RateLimitConfig {
        RateLimitConfig {
            max_requests: 1,
            window_size: Duration::from_secs(60),
            ..RateLimitConfig::default()
        }
    }

    #[test]
    fn test_exponential_backoff_escalation() {
        let limiter = RateLimiter::new(strict_config());

        assert!(limiter.allow("u1").admitted);

        let second = limiter.allow("u1");
        assert!(!second.admitted);
        assert_eq!(second.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(second.reason, Some("rate_limit_exceeded"));

        let third = limiter.allow("u1");
        assert!(!third.admitted);
        assert!(third.retry_after.unwrap() > second.retry_after.unwrap());
        assert!(third.retry_after.unwrap() <= limiter.config.max_backoff);
    }

    #[test]
    fn test_principals_are_independent() {
        let limiter = RateLimiter::new(strict_config());
        assert!(limiter.allow("u1").admitted);
        assert!(!limiter.allow("u1").admitted);
        assert!(limiter.allow("u2").admitted);
    }

    #[test]
    fn test_window_reset_restores_budget() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window_size: Duration::from_millis(20),
            ..RateLimitConfig::default()
        });
        assert!(limiter.allow("u1").admitted);
        assert!(limiter.allow("u1").admitted);
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("u1").admitted);
    }

    #[test]
    fn test_penalize_applies_server_hint() {
        let limiter = RateLimiter::with_defaults();
        limiter.penalize("t1", Duration::from_secs(30));
        let verdict = limiter.allow("t1");
        assert!(!verdict.admitted);
        assert!(verdict.retry_after.is_some());
    }

    #[test]
    fn test_sweep_removes_idle_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            cleanup_interval: Duration::from_millis(10),
            ..RateLimitConfig::default()
        });
        limiter.allow("u1");
        limiter.allow("u2");
        assert_eq!(limiter.bucket_count(), 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.bucket_count(), 0);
    }

    proptest! {
        /// Within one window, admissions never exceed max_requests.
        #[test]
        fn prop_window_admissions_bounded(max_requests in 1u32..20, calls in 1usize..100) {
            let limiter = RateLimiter::new(RateLimitConfig {
                max_requests,
                window_size: Duration::from_secs(3600),
                ..RateLimitConfig::default()
            });
            let admitted = (0..calls)
                .filter(|_| limiter.allow("p").admitted)
                .count();
            prop_assert!(admitted <= max_requests as usize);
        }

        /// Consecutive denials have monotone non-decreasing retry_after,
        /// capped at max_backoff.
        #[test]
        fn prop_backoff_monotone_and_capped(denials in 2usize..40) {
            let limiter = RateLimiter::new(strict_config());
            limiter.allow("p");
            let mut previous = Duration::ZERO;
            for _ in 0..denials {
                let verdict = limiter.allow("p");
                prop_assert!(!verdict.admitted);
                let retry_after = verdict.retry_after.unwrap();
                prop_assert!(retry_after >= previous);
                prop_assert!(retry_after <= limiter.config.max_backoff);
                previous = retry_after;
            }
        }
    }
}
