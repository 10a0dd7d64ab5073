//! Token-bucket request throttling keyed by client IP.
//!
//! Backs the rate-limit stage of the middleware pipeline. Buckets refill
//! continuously; a full bucket is indistinguishable from a fresh one, which
//! is what `cleanup` relies on to bound memory.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::RwLock;

/// Token-bucket configuration.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Tokens restored per second (sustained rate)
    pub refill_per_sec: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_per_sec: 1.0,
        }
    }
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Seconds until a token is available (zero when allowed)
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Per-IP token-bucket limiter.
#[derive(Debug)]
pub struct IpThrottle {
    config: ThrottleConfig,
    buckets: RwLock<HashMap<IpAddr, Bucket>>,
}

impl IpThrottle {
    /// Create a limiter.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Take one token for `ip`, refilling first.
    pub async fn acquire(&self, ip: IpAddr) -> ThrottleDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.config.capacity as f64,
            refreshed: now,
        });

        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec)
            .min(self.config.capacity as f64);
        bucket.refreshed = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            ThrottleDecision {
                allowed: true,
                retry_after_secs: 0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            ThrottleDecision {
                allowed: false,
                retry_after_secs: (deficit / self.config.refill_per_sec).ceil() as u64,
            }
        }
    }

    /// Drop buckets that have refilled to capacity. Returns how many were
    /// removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let capacity = self.config.capacity as f64;
        let refill = self.config.refill_per_sec;

        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
            bucket.tokens + elapsed * refill < capacity
        });
        before - buckets.len()
    }
}
