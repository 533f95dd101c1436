//! Fixed-window rate limiting keyed by an identity string.
//!
//! Flow Overview:
//! 1) The wall clock is cut into windows of `window_seconds`.
//! 2) Each `(scope, window)` pair owns one counter in a shared `CounterStore`.
//! 3) `perform` increments atomically and fails once the count exceeds `limit`.
//!
//! Scaling: the counter store is the only shared state; backing it with Postgres
//! (`storage::PgCounterStore`) keeps limits consistent across instances.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{
    clock::Clock,
    error::{LimitExceeded, StoreError},
};

/// Shared counter storage with atomic increment-and-expire semantics.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count for `key`, zero when missing or expired.
    async fn peek(&self, key: &str) -> Result<u64, StoreError>;

    /// Increment `key` by one and return the new count. A fresh key expires after
    /// `ttl_seconds`.
    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    scope: String,
    limit: u64,
    window_seconds: u64,
    error_code: String,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("scope", &self.scope)
            .field("limit", &self.limit)
            .field("window_seconds", &self.window_seconds)
            .field("error_code", &self.error_code)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        scope: impl Into<String>,
        limit: u64,
        window_seconds: u64,
        error_code: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            scope: scope.into(),
            limit,
            window_seconds: window_seconds.max(1),
            error_code: error_code.into(),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Non-mutating check: would one more attempt in this window be allowed?
    ///
    /// # Errors
    /// Returns an error if the counter store cannot be read.
    pub async fn can_perform(&self) -> Result<bool, StoreError> {
        let (key, _) = self.window_key();
        let count = self.store.peek(&key).await?;
        Ok(count < self.limit)
    }

    /// Record an attempt.
    ///
    /// # Errors
    /// Returns `PerformError::Limited` once the count exceeds the limit within the
    /// current window, or `PerformError::Store` if the counter cannot be updated.
    pub async fn perform(&self) -> Result<(), PerformError> {
        let (key, remaining) = self.window_key();
        let count = self.store.increment(&key, remaining).await?;
        if count > self.limit {
            debug!(scope = %self.scope, count, limit = self.limit, "rate limit exceeded");
            return Err(PerformError::Limited(LimitExceeded {
                error_code: self.error_code.clone(),
                available_in: remaining,
            }));
        }
        Ok(())
    }

    /// Counter key for the current window and the seconds left in it.
    fn window_key(&self) -> (String, u64) {
        let now = u64::try_from(self.clock.now().timestamp()).unwrap_or(0);
        let window = now / self.window_seconds;
        let remaining = self.window_seconds - (now % self.window_seconds);
        (format!("{}:{window}", self.scope), remaining)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PerformError {
    #[error(transparent)]
    Limited(#[from] LimitExceeded),
    #[error(transparent)]
    Store(#[from] StoreError),
}
