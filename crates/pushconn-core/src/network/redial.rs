//! Redial loop with an increasing, jittered backoff.
//!
//! Repeatedly runs a connect operation until it succeeds. Non-retryable
//! errors, the configured attempt bound and the shared cancellation token
//! all end the loop early. The delay
//! after the n-th failure is `timeouts[min(n, len - 1)]` plus a random offset,
//! which keeps a fleet of clients from retrying in lockstep.

use crate::bus::Endpoint;
use crate::cancel::CancellationToken;
use crate::config::RedialConfig;
use crate::error::{ConnError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Random offset in `[-spread_ns, +spread_ns]` nanoseconds.
///
/// # Panics
///
/// Panics if `spread_ns` is negative.
pub fn jitter(spread_ns: i64) -> i64 {
    assert!(spread_ns >= 0, "spread must be non-negative");
    if spread_ns == 0 {
        return 0;
    }
    rand::rng().random_range(-spread_ns..=spread_ns)
}

/// `base` shifted by a jitter of at most `spread`, never below zero.
pub fn jittered(base: Duration, spread: Duration) -> Duration {
    let spread_ns = i64::try_from(spread.as_nanos()).unwrap_or(i64::MAX);
    let offset = jitter(spread_ns);
    if offset >= 0 {
        base.saturating_add(Duration::from_nanos(offset as u64))
    } else {
        base.saturating_sub(Duration::from_nanos(offset.unsigned_abs()))
    }
}

/// Statistics about a redial run.
#[derive(Debug, Clone, Default)]
pub struct RedialStats {
    /// Number of attempts made, 1-based.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if an attempt failed.
    pub last_error: Option<String>,
}

/// Drives a connect operation until it sticks.
#[derive(Debug, Clone)]
pub struct Redialer {
    config: RedialConfig,
    cancel: CancellationToken,
}

impl Redialer {
    pub fn new(config: RedialConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &RedialConfig {
        &self.config
    }

    /// Sleep to apply after `failures` consecutive failed attempts.
    ///
    /// The jitter spread is the base delay capped at `max_jitter`, so the
    /// result is never negative.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.config.timeout_for(failures);
        jittered(base, base.min(self.config.max_jitter))
    }

    /// Run `operation` until it succeeds.
    ///
    /// Returns the final result together with the attempt statistics. When
    /// the token is cancelled the result is `ConnError::Cancelled` and
    /// `stats.attempts` holds the number of attempts made so far.
    pub async fn redial<F, Fut, T>(&self, mut operation: F) -> (Result<T>, RedialStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut stats = RedialStats::default();

        loop {
            if self.cancel.check().is_err() {
                debug!("Redial cancelled after {} attempts", stats.attempts);
                return (Err(ConnError::Cancelled), stats);
            }

            stats.attempts += 1;
            let err = match operation().await {
                Ok(value) => {
                    stats.success = true;
                    if stats.attempts > 1 {
                        debug!("Connected after {} attempts", stats.attempts);
                    }
                    return (Ok(value), stats);
                }
                Err(e) => e,
            };
            stats.last_error = Some(err.to_string());

            if !err.is_retryable() {
                warn!("Attempt {} failed permanently: {}", stats.attempts, err);
                return (Err(err), stats);
            }

            if !self.config.allows_attempt(stats.attempts) {
                warn!(
                    "All {} redial attempts exhausted. Last error: {}",
                    stats.attempts, err
                );
                return (Err(err), stats);
            }

            let delay = self.delay_for(stats.attempts - 1);
            stats.total_delay += delay;
            debug!(
                "Attempt {} failed: {}. Redialing in {:?}",
                stats.attempts, err, delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Redial cancelled after {} attempts", stats.attempts);
                    return (Err(ConnError::Cancelled), stats);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Dial `endpoint` until it connects; returns the number of attempts made.
    pub async fn auto_redial(&self, endpoint: &dyn Endpoint) -> u32 {
        let (result, stats) = self.redial(|| endpoint.dial()).await;
        if let Err(e) = result {
            debug!("Stopped redialing {}: {}", endpoint, e);
        }
        stats.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{Fail2Work, TestingEndpoint, Work};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn immediate() -> Redialer {
        Redialer::new(RedialConfig::immediate(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_auto_redial_works() {
        let endp = TestingEndpoint::new(Fail2Work::new(3), Work(true), vec![]);
        assert_eq!(immediate().auto_redial(&endp).await, 4);
    }

    #[tokio::test]
    async fn test_auto_redial_can_be_stopped() {
        let endp = Arc::new(TestingEndpoint::new(Work(false), Work(true), vec![]));
        let cancel = CancellationToken::new();
        let config = RedialConfig::immediate().with_timeouts(vec![Duration::from_secs(3600)]);
        let redialer = Redialer::new(config, cancel.clone());

        let task = {
            let endp = endp.clone();
            tokio::spawn(async move { redialer.auto_redial(endp.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let attempts = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("redial should stop promptly")
            .unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let redialer = Redialer::new(RedialConfig::immediate(), cancel);

        let (result, stats) = redialer.redial(|| async { Ok::<_, ConnError>(1) }).await;
        assert!(matches!(result, Err(ConnError::Cancelled)));
        assert_eq!(stats.attempts, 0);
    }

    #[tokio::test]
    async fn test_redial_exhausted() {
        let config = RedialConfig::immediate().with_max_attempts(3);
        let redialer = Redialer::new(config, CancellationToken::new());

        let (result, stats) = redialer
            .redial(|| async { Err::<i32, _>(ConnError::bus("always fails")) })
            .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 3);
        assert!(!stats.success);
        assert_eq!(stats.last_error, Some("Bus error: always fails".to_string()));
    }

    #[tokio::test]
    async fn test_redial_stops_on_permanent_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let (result, stats) = immediate()
            .redial(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ConnError::UnexpectedValue {
                        what: "State".to_string(),
                        expected: "u32",
                        actual: "string".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ConnError::UnexpectedValue { .. })));
        assert_eq!(stats.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!stats.success);
    }

    #[tokio::test]
    async fn test_redial_returns_value() {
        let counter = Arc::new(AtomicU32::new(0));
        let (result, stats) = immediate()
            .redial(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ConnError::bus("temporary failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 3);
        assert!(stats.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_follows_schedule() {
        let config = RedialConfig::immediate()
            .with_timeouts(vec![Duration::from_secs(1), Duration::from_secs(5)])
            .with_max_attempts(4);
        let redialer = Redialer::new(config, CancellationToken::new());

        let (_, stats) = redialer
            .redial(|| async { Err::<(), _>(ConnError::bus("down")) })
            .await;

        // 1s after the first failure, then 5s after each later one.
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.total_delay, Duration::from_secs(11));
    }

    #[test]
    fn test_jitter_spans_both_signs() {
        let spread = Duration::from_secs(1).as_nanos() as i64;
        let mut has_neg = false;
        let mut has_pos = false;
        for _ in 0..100 {
            let n = jitter(spread);
            assert!((-spread..=spread).contains(&n));
            if n > 0 {
                has_pos = true;
            } else if n < 0 {
                has_neg = true;
            }
        }
        assert!(has_neg);
        assert!(has_pos);
        assert_eq!(jitter(0), 0);
    }

    #[test]
    #[should_panic(expected = "spread must be non-negative")]
    fn test_negative_spread_panics() {
        jitter(-1);
    }

    #[test]
    fn test_delay_stays_within_spread() {
        let config = RedialConfig::immediate()
            .with_timeouts(vec![Duration::from_secs(2)])
            .with_max_jitter(Duration::from_secs(1));
        let redialer = Redialer::new(config, CancellationToken::new());
        for _ in 0..50 {
            let delay = redialer.delay_for(0);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }
}
