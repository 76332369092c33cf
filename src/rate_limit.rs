//! Token bucket rate limiting for DoS protection

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Per-key bucket map with a hard entry cap. On overflow the stalest bucket
/// (longest since last touch) is evicted, so the map stays bounded even under
/// a key-churn flood.
#[derive(Debug)]
pub struct KeyedLimiter<K: Eq + Hash + Clone> {
    buckets: HashMap<K, (TokenBucket, Instant)>,
    capacity: f64,
    rate_per_sec: f64,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone> KeyedLimiter<K> {
    pub fn new(capacity: f64, rate_per_sec: f64, max_entries: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            capacity,
            rate_per_sec,
            max_entries,
        }
    }

    pub fn try_consume(&mut self, key: &K) -> bool {
        if !self.buckets.contains_key(key) && self.buckets.len() >= self.max_entries {
            self.evict_stalest();
        }
        let (capacity, rate) = (self.capacity, self.rate_per_sec);
        let (bucket, touched) = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| (TokenBucket::new(capacity, rate), Instant::now()));
        *touched = Instant::now();
        bucket.try_consume(1.0)
    }

    fn evict_stalest(&mut self) {
        if let Some(key) = self
            .buckets
            .iter()
            .min_by_key(|(_, (_, touched))| *touched)
            .map(|(k, _)| k.clone())
        {
            self.buckets.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Suppresses repeated warnings. Allows a short burst, then one line per
/// `period_secs`; everything else is silently dropped.
#[derive(Debug)]
pub struct WarnLimiter {
    bucket: TokenBucket,
}

impl WarnLimiter {
    pub fn new(burst: f64, period_secs: f64) -> Self {
        Self {
            bucket: TokenBucket::new(burst, 1.0 / period_secs),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.bucket.try_consume(1.0)
    }
}

impl Default for WarnLimiter {
    fn default() -> Self {
        Self::new(5.0, 30.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_consumes_burst_then_blocks() {
        let mut bucket = TokenBucket::new(3.0, 0.0);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0, 1000.0);
        assert!(bucket.try_consume(1.0));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(bucket.try_consume(1.0));
    }

    #[test]
    fn keyed_limiter_is_bounded() {
        let mut limiter: KeyedLimiter<u32> = KeyedLimiter::new(1.0, 0.0, 8);
        for key in 0..100u32 {
            limiter.try_consume(&key);
        }
        assert!(limiter.len() <= 8);
    }

    #[test]
    fn keyed_limiter_isolates_keys() {
        let mut limiter: KeyedLimiter<u32> = KeyedLimiter::new(1.0, 0.0, 8);
        assert!(limiter.try_consume(&1));
        assert!(!limiter.try_consume(&1));
        assert!(limiter.try_consume(&2));
    }

    #[test]
    fn warn_limiter_suppresses() {
        let mut warn = WarnLimiter::new(2.0, 60.0);
        assert!(warn.allow());
        assert!(warn.allow());
        assert!(!warn.allow());
    }
}
