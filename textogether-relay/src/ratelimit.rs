//! Per-connection limits on published frames.
//!
//! Each connection owns a token bucket: `capacity` frames may be sent back to
//! back, after which tokens trickle in at `per_second`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Frames a connection may publish in one burst
    pub capacity: u32,
    /// Frames credited back every second
    pub per_second: f64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            per_second: 100.0,
            enabled: true,
        }
    }
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl Bucket {
    fn full(config: &RateLimitConfig) -> Self {
        Bucket {
            tokens: f64::from(config.capacity),
            updated: Instant::now(),
        }
    }

    /// Spend one token, or report how long until one is available.
    fn take(&mut self, config: &RateLimitConfig, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.per_second).min(f64::from(config.capacity));
        self.updated = now;

        match self.tokens {
            t if t >= 1.0 => {
                self.tokens = t - 1.0;
                Ok(())
            }
            _ if config.per_second <= 0.0 => Err(Duration::MAX),
            t => Err(Duration::from_secs_f64((1.0 - t) / config.per_second)),
        }
    }
}

/// Token buckets keyed by connection id.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<RwLock<HashMap<u64, Bucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            buckets: Arc::default(),
        }
    }

    /// `Err(retry_after)` when `connection` has used up its budget.
    pub async fn check(&self, connection: u64) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        self.buckets
            .write()
            .await
            .entry(connection)
            .or_insert_with(|| Bucket::full(&self.config))
            .take(&self.config, Instant::now())
    }

    /// Drop the bucket of a closed connection.
    pub async fn forget(&self, connection: u64) {
        self.buckets.write().await.remove(&connection);
    }

    pub async fn tracked(&self) -> usize {
        self.buckets.read().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, per_second: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            per_second,
            enabled: true,
        })
    }

    #[tokio::test]
    async fn test_burst_then_refused() {
        let limiter = limiter(3, 1.0);
        for _ in 0..3 {
            assert!(limiter.check(1).await.is_ok());
        }
        let retry = limiter.check(1).await.unwrap_err();
        assert!(retry > Duration::ZERO);
        assert!(retry <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connections_have_separate_buckets() {
        let limiter = limiter(1, 0.1);

        assert!(limiter.check(1).await.is_ok());
        assert!(limiter.check(2).await.is_ok());
        assert!(limiter.check(1).await.is_err());

        limiter.forget(1).await;
        assert_eq!(limiter.tracked().await, 1);
        assert!(limiter.check(1).await.is_ok());
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let config = RateLimitConfig {
            capacity: 2,
            per_second: 10.0,
            enabled: true,
        };
        let mut bucket = Bucket::full(&config);
        let start = bucket.updated;
        assert!(bucket.take(&config, start).is_ok());
        assert!(bucket.take(&config, start).is_ok());
        assert!(bucket.take(&config, start).is_err());
        assert!(bucket.take(&config, start + Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn test_zero_refill_never_recovers() {
        let config = RateLimitConfig {
            capacity: 1,
            per_second: 0.0,
            enabled: true,
        };
        let mut bucket = Bucket::full(&config);
        let start = bucket.updated;
        assert!(bucket.take(&config, start).is_ok());
        assert_eq!(bucket.take(&config, start), Err(Duration::MAX));
    }

    #[tokio::test]
    async fn test_disabled_limiter_tracks_nothing() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 1,
            per_second: 0.0,
            enabled: false,
        });
        for _ in 0..100 {
            assert!(limiter.check(7).await.is_ok());
        }
        assert_eq!(limiter.tracked().await, 0);
    }
}
