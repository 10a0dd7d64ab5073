//! Rate & replay cache: per-user attempt counters and single-use code
//! markers over a TTL-keyed store.
//!
//! Every operation is atomic from the caller's viewpoint. If the backing
//! store is unreachable during a verification, callers must fail closed
//! (`ServiceUnavailable`), never implicitly allow the attempt; the
//! `From<CacheError> for AuthError` conversion encodes that.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Replay markers outlive the full ±1-step TOTP acceptance window.
pub const REPLAY_TTL_SECS: u64 = 3 * coffer_crypto::totp::PERIOD_SECS;

/// Cache failure. There is exactly one kind: the store was unreachable.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be reached or refused the operation
    #[error("verification cache unavailable: {0}")]
    Unavailable(String),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Attempt counting and replay poisoning for MFA verification.
#[async_trait]
pub trait VerificationCache: Send + Sync {
    /// Increment the user's attempt counter. The TTL window starts on the
    /// first increment.
    async fn increment_attempts(&self, user_id: Uuid) -> Result<()>;

    /// Current attempt count; absent key reads as zero.
    async fn attempts(&self, user_id: Uuid) -> Result<u32>;

    /// Delete the user's attempt counter.
    async fn reset_attempts(&self, user_id: Uuid) -> Result<()>;

    /// Atomically mark a `(device, code)` pair as used. Returns `true` if
    /// this call set the marker (the code was previously unused).
    ///
    /// This single test-and-set primitive is the whole replay check; there
    /// is deliberately no separate "is used?" read.
    async fn mark_code_used(&self, device_id: Uuid, code: &str) -> Result<bool>;
}

fn attempts_key(user_id: Uuid) -> String {
    format!("mfa_attempts:{}", user_id)
}

fn used_key(device_id: Uuid, code: &str) -> String {
    format!("used:{}:{}", device_id, code)
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed verification cache (production).
pub struct RedisCache {
    client: redis::Client,
    attempts_window_secs: u64,
}

impl RedisCache {
    /// Create a cache from a redis URL and the attempt-window TTL.
    pub fn new(redis_url: &str, attempts_window_secs: u64) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            attempts_window_secs,
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis connection failed: {}", e)))
    }
}

#[async_trait]
impl VerificationCache for RedisCache {
    async fn increment_attempts(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = attempts_key(user_id);

        let count: i64 = redis::cmd("INCR")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis INCR failed: {}", e)))?;

        // The window starts with the first failed attempt
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.attempts_window_secs)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| CacheError::Unavailable(format!("redis EXPIRE failed: {}", e)))?;
        }

        debug!(user_id = %user_id, attempts = count, "MFA attempt recorded");
        Ok(())
    }

    async fn attempts(&self, user_id: Uuid) -> Result<u32> {
        let mut conn = self.conn().await?;
        let count: Option<u32> = redis::cmd("GET")
            .arg(attempts_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis GET failed: {}", e)))?;
        Ok(count.unwrap_or(0))
    }

    async fn reset_attempts(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(attempts_key(user_id))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis DEL failed: {}", e)))?;
        Ok(())
    }

    async fn mark_code_used(&self, device_id: Uuid, code: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        // SET NX EX is the atomic test-and-set; "OK" means we set it first
        let set: Option<String> = redis::cmd("SET")
            .arg(used_key(device_id, code))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(REPLAY_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis SET failed: {}", e)))?;
        Ok(set.is_some())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct MemoryState {
    attempts: HashMap<Uuid, (u32, Instant)>,
    used: HashMap<(Uuid, String), Instant>,
}

/// In-memory verification cache for development and tests.
///
/// Single-process only; production deployments configure redis so counters
/// and replay markers are shared across instances.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    window: Duration,
}

impl MemoryCache {
    /// Create a cache with the given attempt-window TTL.
    pub fn new(attempts_window_secs: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                attempts: HashMap::new(),
                used: HashMap::new(),
            }),
            window: Duration::from_secs(attempts_window_secs),
        }
    }
}

#[async_trait]
impl VerificationCache for MemoryCache {
    async fn increment_attempts(&self, user_id: Uuid) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let entry = state
            .attempts
            .entry(user_id)
            .or_insert((0, now + self.window));
        if entry.1 <= now {
            // Window elapsed: the next failure starts a fresh one
            *entry = (0, now + self.window);
        }
        entry.0 += 1;
        Ok(())
    }

    async fn attempts(&self, user_id: Uuid) -> Result<u32> {
        let now = Instant::now();
        let state = self.state.lock().await;
        Ok(match state.attempts.get(&user_id) {
            Some((count, deadline)) if *deadline > now => *count,
            _ => 0,
        })
    }

    async fn reset_attempts(&self, user_id: Uuid) -> Result<()> {
        self.state.lock().await.attempts.remove(&user_id);
        Ok(())
    }

    async fn mark_code_used(&self, device_id: Uuid, code: &str) -> Result<bool> {
        let now = Instant::now();
        let ttl = Duration::from_secs(REPLAY_TTL_SECS);
        let mut state = self.state.lock().await;
        state.used.retain(|_, deadline| *deadline > now);

        let key = (device_id, code.to_string());
        if state.used.contains_key(&key) {
            return Ok(false);
        }
        state.used.insert(key, now + ttl);
        Ok(true)
    }
}
