//! Per-client token-bucket rate limiting.
//!
//! Buckets are keyed by caller identity (API key id, agent id, or source
//! address for unauthenticated paths). A janitor pass drops buckets that
//! have been idle long enough to refill completely, bounding memory under
//! churny clients.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket limiter with one bucket per caller key.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    /// Build a limiter allowing `per_minute` requests per key, with burst
    /// capacity equal to the per-minute budget.
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    /// Take one token for `key`.
    ///
    /// # Errors
    ///
    /// Returns the seconds until a token is available when the bucket is
    /// empty.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let Ok(mut buckets) = self.buckets.lock() else {
            // A poisoned limiter must not take the API down.
            return Ok(());
        };
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
            Err(wait.ceil() as u64)
        }
    }

    /// Drop buckets that have fully refilled — they carry no state a fresh
    /// bucket would not.
    pub fn sweep_stale(&self) {
        let idle_cutoff = Duration::from_secs_f64(60.0_f64.max(self.capacity / self.refill_per_sec));
        if let Ok(mut buckets) = self.buckets.lock() {
            let now = Instant::now();
            buckets.retain(|_, b| now.duration_since(b.last_refill) < idle_cutoff);
        }
    }

    /// Number of live buckets (test and metrics hook).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn allows_burst_up_to_capacity() {
        let limiter = RateLimiter::per_minute(5);
        for _ in 0..5 {
            assert!(limiter.check("client").is_ok());
        }
        let wait = limiter.check("client").unwrap_err();
        assert!(wait >= 1);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::per_minute(1);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let limiter = RateLimiter::per_minute(60);
        let _ = limiter.check("x");
        assert_eq!(limiter.bucket_count(), 1);
        // The bucket is fresh, so it survives a sweep.
        limiter.sweep_stale();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
