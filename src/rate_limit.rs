//! Per-user fixed-window rate limiter.

use crate::config::RateLimitConfig;
use moka::sync::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Counts requests per user. A user's window opens on their first request and
/// lasts `window`; the counter expires with it.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Cache<String, Arc<AtomicU32>>,
    max_requests: u32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("tracked_users", &self.windows.entry_count())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            windows: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(window)
                .build(),
            max_requests,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.max_requests)
    }

    /// Count one request for `user_id`. Returns false once the user is over the limit.
    pub fn check(&self, user_id: &str) -> bool {
        let counter = self
            .windows
            .get_with(user_id.to_string(), || Arc::new(AtomicU32::new(0)));
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;

        if count > self.max_requests {
            tracing::debug!(user_id, count, max = self.max_requests, "rate limited");
            return false;
        }
        true
    }

    /// Forget every user's window.
    pub fn reset_all(&self) {
        self.windows.invalidate_all();
    }
}
