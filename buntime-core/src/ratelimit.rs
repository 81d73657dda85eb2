//! # Token-Bucket Rate Limiter
//!
//! Per-key token buckets for admission control. Each key (IP, user id,
//! anything the caller chooses) owns a bucket of capacity `C` refilled at
//! `C / window_seconds` tokens per second. A consume takes one token; when
//! the bucket is dry the caller gets a denial with the number of whole
//! seconds until a token is available again.
//!
//! Buckets sitting at full capacity carry no information, so a periodic
//! [`RateLimiter::sweep`] drops them to bound memory. The sweep task itself
//! belongs to whoever owns the limiter.

use dashmap::DashMap;
use std::time::Instant;

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole tokens left after this attempt
    pub remaining: u32,
    /// Seconds until the next token when denied, zero when allowed
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter over an arbitrary key space.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    capacity: f64,
    /// tokens per second
    rate: f64,
}

impl RateLimiter {
    /// `capacity` requests per `window_seconds` sliding window.
    pub fn new(capacity: u32, window_seconds: u64) -> Self {
        let capacity = f64::from(capacity.max(1));
        let window = window_seconds.max(1) as f64;
        Self {
            buckets: DashMap::new(),
            capacity,
            rate: capacity / window,
        }
    }

    /// Take one token for `key`, refilling for the elapsed time first.
    pub fn consume(&self, key: &str) -> RateDecision {
        self.consume_at(key, Instant::now())
    }

    fn consume_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision {
                allowed: true,
                remaining: bucket.tokens.floor() as u32,
                retry_after_secs: 0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: (deficit / self.rate).ceil() as u64,
            }
        }
    }

    /// Drop buckets that have refilled back to capacity. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
            (bucket.tokens + elapsed * self.rate) < self.capacity
        });
        before - self.buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn five_allowed_then_denied_with_bounded_retry() {
        let limiter = RateLimiter::new(5, 60);
        let now = Instant::now();
        for i in 0..5 {
            let d = limiter.consume_at("ip:1.2.3.4", now);
            assert!(d.allowed, "request {i} should pass");
        }
        let denied = limiter.consume_at("ip:1.2.3.4", now);
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0);
        // rate is 5/60 tokens per second, so one token takes at most 12s
        assert!(denied.retry_after_secs <= 12, "got {}", denied.retry_after_secs);
    }

    #[test]
    fn refill_restores_tokens() {
        let limiter = RateLimiter::new(2, 2);
        let start = Instant::now();
        assert!(limiter.consume_at("k", start).allowed);
        assert!(limiter.consume_at("k", start).allowed);
        assert!(!limiter.consume_at("k", start).allowed);
        // one second refills one token at 2 tokens / 2s
        let later = start + Duration::from_secs(1);
        assert!(limiter.consume_at("k", later).allowed);
        assert!(!limiter.consume_at("k", later).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 60);
        let now = Instant::now();
        assert!(limiter.consume_at("a", now).allowed);
        assert!(limiter.consume_at("b", now).allowed);
        assert!(!limiter.consume_at("a", now).allowed);
    }

    #[test]
    fn sweep_drops_only_full_buckets() {
        let limiter = RateLimiter::new(1, 3600);
        let now = Instant::now();
        limiter.consume_at("busy", now);
        // "idle" gets a token taken and instantly refunded at full capacity
        // by never consuming at all
        limiter.buckets.insert(
            "idle".to_string(),
            Bucket {
                tokens: 1.0,
                last_refill: now,
            },
        );
        assert_eq!(limiter.tracked_keys(), 2);
        let removed = limiter.sweep();
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
