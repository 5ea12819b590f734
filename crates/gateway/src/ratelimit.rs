//! Per-principal token buckets gating new stream admissions. Delivery of
//! individual records is never rate limited.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: f64::from(per_minute) / 60.0,
            burst: f64::from(burst.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `subject`; false when the bucket is empty.
    pub fn allow(&self, subject: &str) -> bool {
        self.allow_at(subject, Instant::now())
    }

    fn allow_at(&self, subject: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(subject.to_string())
            .or_insert(Bucket { tokens: self.burst, refilled: now });
        let elapsed = now.saturating_duration_since(bucket.refilled).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.refilled = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_reject() {
        let limiter = RateLimiter::new(60, 3);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.allow_at("alice", now));
        }
        assert!(!limiter.allow_at("alice", now));
    }

    #[test]
    fn refills_at_the_configured_rate() {
        // 60/min = 1 token per second.
        let limiter = RateLimiter::new(60, 1);
        let t0 = Instant::now();
        assert!(limiter.allow_at("alice", t0));
        assert!(!limiter.allow_at("alice", t0));
        assert!(!limiter.allow_at("alice", t0 + Duration::from_millis(300)));
        assert!(limiter.allow_at("alice", t0 + Duration::from_millis(1400)));
    }

    #[test]
    fn buckets_are_per_subject() {
        let limiter = RateLimiter::new(60, 1);
        let now = Instant::now();
        assert!(limiter.allow_at("alice", now));
        assert!(!limiter.allow_at("alice", now));
        assert!(limiter.allow_at("bob", now));
    }

    #[test]
    fn refill_never_exceeds_burst() {
        let limiter = RateLimiter::new(600, 2);
        let t0 = Instant::now();
        assert!(limiter.allow_at("alice", t0));
        // A long quiet period refills to the burst cap, not beyond.
        let later = t0 + Duration::from_secs(3600);
        assert!(limiter.allow_at("alice", later));
        assert!(limiter.allow_at("alice", later));
        assert!(!limiter.allow_at("alice", later));
    }
}
