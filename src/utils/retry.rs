//! Retry utilities: fixed-interval policies built on `backon`.
//!
//! The connector never spins: every wait is a fixed delay produced by a
//! [`RetryPolicy`]. Policies are unbounded by default and can be capped so
//! tests (and callers wanting a hard timeout) can bound them.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use tracing::{error, warn};

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts.
    pub interval: Duration,
    /// Retries after the first attempt. `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Unbounded policy with the given interval.
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Policy that stops once `timeout` worth of intervals have elapsed.
    pub fn bounded_by(interval: Duration, timeout: Option<Duration>) -> Self {
        let policy = Self::fixed(interval);
        match timeout {
            Some(timeout) if !interval.is_zero() => {
                let attempts = timeout.as_nanos().div_ceil(interval.as_nanos());
                policy.with_max_attempts(usize::try_from(attempts).unwrap_or(usize::MAX))
            }
            Some(_) => policy.with_max_attempts(0),
            None => policy,
        }
    }

    /// Total time the policy may wait, if bounded.
    pub fn budget(&self) -> Option<Duration> {
        self.max_attempts.map(|attempts| {
            self.interval
                .saturating_mul(u32::try_from(attempts).unwrap_or(u32::MAX))
        })
    }

    /// Delays between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ConstantBuilder::default()
            .with_delay(self.interval)
            .with_max_times(self.max_attempts.unwrap_or(usize::MAX))
            .build()
    }
}

/// Probe `ready` until it reports true, sleeping `policy.interval` between probes.
///
/// Returns false if the policy is exhausted first.
pub async fn poll_until<F>(policy: &RetryPolicy, mut ready: F) -> bool
where
    F: FnMut() -> bool,
{
    if ready() {
        return true;
    }
    for delay in policy.delays() {
        tokio::time::sleep(delay).await;
        if ready() {
            return true;
        }
    }
    false
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// # Arguments
/// * `what` - Human-readable name for logging (e.g., "sentinel")
/// * `operation` - Async function performing one attempt
///
/// # Returns
/// The first success, or the last error once retries run out.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = policy.delays();
    let mut attempt: usize = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        target_name = %what,
                        attempt,
                        error = %e,
                        retry_in = ?delay,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        target_name = %what,
                        attempts = attempt,
                        error = %e,
                        "Giving up after retries"
                    );
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_bounded_by_rounds_up() {
        let policy = RetryPolicy::bounded_by(
            Duration::from_millis(200),
            Some(Duration::from_millis(500)),
        );
        assert_eq!(policy.max_attempts, Some(3));
        assert_eq!(policy.budget(), Some(Duration::from_millis(600)));
    }

    #[test]
    fn test_unbounded_has_no_budget() {
        let policy = RetryPolicy::fixed(Duration::from_millis(200));
        assert_eq!(policy.budget(), None);
        assert_eq!(policy.delays().take(1_000).count(), 1_000);
    }

    #[test]
    fn test_delays_are_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(200)).with_max_attempts(3);
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(200); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready_after_probes() {
        let probes = AtomicUsize::new(0);
        let policy = RetryPolicy::fixed(Duration::from_millis(200));
        let ready = poll_until(&policy, || probes.fetch_add(1, Ordering::SeqCst) >= 3).await;
        assert!(ready);
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_exhausted() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2);
        let probes = AtomicUsize::new(0);
        let ready = poll_until(&policy, || {
            probes.fetch_add(1, Ordering::SeqCst);
            false
        })
        .await;
        assert!(!ready);
        assert_eq!(probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_policy_succeeds_eventually() {
        let attempts = AtomicUsize::new(0);
        let policy = RetryPolicy::fixed(Duration::from_millis(50));
        let result: Result<usize, String> = retry_with_policy(&policy, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 4 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_policy_returns_last_error() {
        let policy = RetryPolicy::fixed(Duration::from_millis(50)).with_max_attempts(2);
        let attempts = AtomicUsize::new(0);
        let result: Result<(), String> = retry_with_policy(&policy, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {n}")) }
        })
        .await;
        assert_eq!(result, Err("attempt 2".to_string()));
    }
}
