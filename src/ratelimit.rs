//! Distributed fixed-window rate limiter
//!
//! One atomic round trip per call: increment `prefix:scope:subject`, start
//! the window expiry on the first hit, read the remaining TTL. The caller
//! decides what "over the limit" means (`count > limit`).
//!
//! An unset limiter, limit or window is a no-op: absence of limiting means
//! "allow".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::reconcile::ReconcileError;

/// Shortest window accepted
const MIN_WINDOW_MS: u64 = 1_000;

/// INCR + PEXPIRE-on-first-hit + PTTL. A key left without TTL (-1) gets one.
const FIXED_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if current == 1 or ttl == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Consumption {
    /// Hits in the current window, including this one
    pub count: u64,
    /// Seconds until the window resets (0 when limiting is off)
    pub retry_after_secs: u64,
}

impl Consumption {
    #[inline]
    pub fn exceeds(&self, limit: u64) -> bool {
        limit > 0 && self.count > limit
    }
}

/// Window counter storage
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Increment `key`, returning (count, remaining window in ms)
    async fn incr_window(&self, key: &str, window_ms: u64) -> Result<(u64, u64), ReconcileError>;
}

/// Redis backend; the Lua script keeps the three steps atomic across nodes
pub struct RedisCounter {
    conn: redis::aio::ConnectionManager,
    script: redis::Script,
}

impl RedisCounter {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self {
            conn,
            script: redis::Script::new(FIXED_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterBackend for RedisCounter {
    async fn incr_window(&self, key: &str, window_ms: u64) -> Result<(u64, u64), ReconcileError> {
        let mut conn = self.conn.clone();
        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok((count.max(0) as u64, ttl_ms.max(0) as u64))
    }
}

/// Process-local backend for single-node runs and tests
#[derive(Default)]
pub struct MemoryCounter {
    windows: DashMap<String, (u64, Instant)>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterBackend for MemoryCounter {
    async fn incr_window(&self, key: &str, window_ms: u64) -> Result<(u64, u64), ReconcileError> {
        let now = Instant::now();
        let window = Duration::from_millis(window_ms);
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert((0, now + window));
        if now >= entry.1 {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        let remaining = entry.1.saturating_duration_since(now).as_millis() as u64;
        Ok((entry.0, remaining))
    }
}

pub struct RateLimiter {
    backend: Option<Arc<dyn CounterBackend>>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn CounterBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend: Some(backend),
            prefix: prefix.into(),
        }
    }

    /// Limiter that never counts
    pub fn disabled() -> Self {
        Self {
            backend: None,
            prefix: String::new(),
        }
    }

    pub async fn consume(
        &self,
        scope: &str,
        subject: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Consumption, ReconcileError> {
        let Some(backend) = &self.backend else {
            return Ok(Consumption::default());
        };
        if limit == 0 || window.is_zero() {
            return Ok(Consumption::default());
        }

        let window_ms = (window.as_millis() as u64).max(MIN_WINDOW_MS);
        let key = format!("{}:{}:{}", self.prefix, scope, subject);
        let (count, ttl_ms) = backend.incr_window(&key, window_ms).await?;

        Ok(Consumption {
            count,
            retry_after_secs: ttl_ms.div_ceil(1_000),
        })
    }
}
