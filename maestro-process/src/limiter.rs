//! ABOUTME: Per-user rolling-window rate limiter over the shared store
//! ABOUTME: Counter with TTL; denial reasons surface in process state

use std::sync::Arc;
use std::time::Duration;

use maestro_core::Result;
use maestro_store::{keys, StoreBackend};

/// Rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Rolling window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Windowed per-user request counter
pub struct RateLimiter {
    store: Arc<dyn StoreBackend>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StoreBackend>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Record one request; Ok(true) when allowed, Ok(false) when denied
    pub async fn check(&self, user_id: &str) -> Result<bool> {
        let key = keys::process_rate_limit(user_id);
        let count = self
            .store
            .incr_by(&key, 1, Some(self.config.window))
            .await?;
        Ok(count as u64 <= self.config.max_requests)
    }

    /// Human-readable denial reason
    pub fn denial_reason(&self, user_id: &str) -> String {
        format!(
            "rate limit exceeded for user '{}': {} requests per {}s",
            user_id,
            self.config.max_requests,
            self.config.window.as_secs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_store::MemoryBackend;

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryBackend::new()),
            RateLimitConfig {
                max_requests: 3,
                window: Duration::from_secs(60),
            },
        );
        for _ in 0..3 {
            assert!(limiter.check("u1").await.unwrap());
        }
        assert!(!limiter.check("u1").await.unwrap());
        // Other users are unaffected
        assert!(limiter.check("u2").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryBackend::new()),
            RateLimitConfig {
                max_requests: 1,
                window: Duration::from_millis(30),
            },
        );
        assert!(limiter.check("u1").await.unwrap());
        assert!(!limiter.check("u1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.check("u1").await.unwrap());
    }
}
