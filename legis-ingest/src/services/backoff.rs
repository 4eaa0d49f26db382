//! Shared retry policy: attempt ceiling, exponential delay, jitter
//!
//! Used for upstream requests, record/index writes, and migration batch
//! transactions, so every retry loop in the pipeline backs off the same way.

use crate::error::{IngestError, IngestResult};
use legis_common::config::{FetchConfig, MigrationConfig};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with multiplicative jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that is randomized, in [0.0, 1.0]
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction; non-finite values disable jitter
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Policy for upstream requests
    pub fn for_fetch(config: &FetchConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }

    /// Policy for file-tier writes (same delays, own attempt ceiling)
    pub fn for_storage(config: &FetchConfig) -> Self {
        Self::new(
            config.storage_write_attempts,
            Duration::from_millis(config.base_delay_ms.min(200)),
            Duration::from_millis(config.max_delay_ms.min(2_000)),
        )
        .with_jitter(config.jitter)
    }

    /// Policy for migration batch transactions
    pub fn for_migration(config: &MigrationConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(0.2)
    }

    /// Un-jittered delay before attempt `attempt + 1` (attempt is 1-based)
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Jittered delay before attempt `attempt + 1`
    ///
    /// The result lies in `[d * (1 - jitter), d]` where `d` is the base delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(factor)
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::for_fetch(&FetchConfig::default())
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if the token fires
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> IngestResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(IngestError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(6, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::new(4, Duration::from_millis(1000), Duration::from_secs(10))
            .with_jitter(0.5);
        for _ in 0..200 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_non_finite_jitter_disabled() {
        let base = BackoffPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = base.clone().with_jitter(jitter);
            assert_eq!(policy.jitter, 0.0);
            assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        }
        assert_eq!(base.with_jitter(7.0).jitter, 1.0);
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = BackoffPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert_eq!(BackoffPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_cancellable_returns_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = sleep_cancellable(Duration::from_secs(3600), &cancel).await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
    }
}
