//! In-memory rate limiting: token buckets and per-IP admission.
//!
//! DESIGN
//! ======
//! Every limit in the system is a non-blocking token bucket: `allow()`
//! either takes a token or reports deny, it never waits. Buckets start
//! full so a fresh session or IP gets its burst immediately. The IP
//! admission map tracks `last_seen` per entry so the sweeper can drop
//! buckets that have gone quiet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// New-connection admission per IP: one connection every 6 seconds.
const IP_CONNECTION_INTERVAL: Duration = Duration::from_secs(6);
/// Burst of connections a fresh IP may open at once.
const IP_CONNECTION_BURST: u32 = 5;
/// IP entries unused for this long are dropped by the sweeper.
const IP_IDLE_TTL: Duration = Duration::from_secs(3600);

// =============================================================================
// TOKEN BUCKET
// =============================================================================

/// Non-blocking token bucket. Refills continuously at `rate` tokens per
/// second up to `burst`; each allowed call consumes one token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket that sustains `rate` events/sec with `burst`
    /// capacity. Starts full.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Internal: allow with explicit timestamp (for testing).
    pub(crate) fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// IP ADMISSION LIMITER
// =============================================================================

struct IpEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-IP new-connection limiter. Entries are created lazily on first
/// sight of an address and expired by the sweeper once idle.
#[derive(Clone)]
pub struct IpRateLimit {
    inner: Arc<Mutex<HashMap<String, IpEntry>>>,
}

impl IpRateLimit {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Check whether a connection attempt from `ip` is admitted.
    pub fn allow(&self, ip: &str) -> bool {
        self.allow_at(ip, Instant::now())
    }

    fn allow_at(&self, ip: &str, now: Instant) -> bool {
        let mut limiters = self.inner.lock().unwrap();
        let entry = limiters.entry(ip.to_string()).or_insert_with(|| IpEntry {
            bucket: TokenBucket::new(
                1.0 / IP_CONNECTION_INTERVAL.as_secs_f64(),
                IP_CONNECTION_BURST,
            ),
            last_seen: now,
        });
        entry.last_seen = now;
        entry.bucket.allow_at(now)
    }

    /// Drop entries not seen within the idle TTL. Returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let mut limiters = self.inner.lock().unwrap();
        let before = limiters.len();
        limiters.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= IP_IDLE_TTL);
        before - limiters.len()
    }

    /// Number of tracked IPs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IpRateLimit {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_full_burst_then_denies() {
        let mut bucket = TokenBucket::new(1.0, 5);
        let now = Instant::now();

        for i in 0..5 {
            assert!(bucket.allow_at(now), "burst token {i} should be granted");
        }
        assert!(!bucket.allow_at(now));
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(2.0, 1);
        let start = Instant::now();

        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start));

        // 2 tokens/sec: one token back after 500ms.
        assert!(bucket.allow_at(start + Duration::from_millis(500)));
        assert!(!bucket.allow_at(start + Duration::from_millis(500)));
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let mut bucket = TokenBucket::new(10.0, 3);
        let start = Instant::now();

        // A long quiet period must not accumulate more than `burst` tokens.
        let later = start + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(bucket.allow_at(later));
        }
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn ip_limiter_grants_burst_then_denies() {
        let limiter = IpRateLimit::new();
        let now = Instant::now();

        for i in 0..5 {
            assert!(limiter.allow_at("10.0.0.1", now), "connection {i} should pass");
        }
        assert!(!limiter.allow_at("10.0.0.1", now));
    }

    #[test]
    fn ip_limiter_recovers_after_interval() {
        let limiter = IpRateLimit::new();
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("10.0.0.1", start));
        }
        assert!(!limiter.allow_at("10.0.0.1", start));
        assert!(limiter.allow_at("10.0.0.1", start + Duration::from_secs(6)));
    }

    #[test]
    fn distinct_ips_do_not_interfere() {
        let limiter = IpRateLimit::new();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at("10.0.0.1", now));
        }
        assert!(!limiter.allow_at("10.0.0.1", now));
        assert!(limiter.allow_at("10.0.0.2", now));
    }

    #[test]
    fn cleanup_drops_idle_entries_only() {
        let limiter = IpRateLimit::new();
        let start = Instant::now();

        limiter.allow_at("10.0.0.1", start);
        limiter.allow_at("10.0.0.2", start + Duration::from_secs(3000));
        assert_eq!(limiter.len(), 2);

        // At start+1h+ε the first entry is idle past the TTL, the second is not.
        let removed = limiter.cleanup_at(start + IP_IDLE_TTL + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn cleanup_keeps_entry_at_exact_ttl() {
        let limiter = IpRateLimit::new();
        let start = Instant::now();

        limiter.allow_at("10.0.0.1", start);
        assert_eq!(limiter.cleanup_at(start + IP_IDLE_TTL), 0);
        assert_eq!(limiter.len(), 1);
    }
}
