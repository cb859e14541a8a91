//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Status codes retried by default: 408, 429, 500, 502, 503, 504.
pub fn default_retryable_codes() -> HashSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

/// Configuration for bounded exponential-backoff retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Base delay used for attempt 0's backoff.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`; the backoff is multiplied by a factor drawn
    /// uniformly from `[1 - jitter, 1 + jitter]`, clamped at zero.
    pub jitter: f64,
    /// Timeout applied to each individual attempt.
    pub timeout_per_attempt: Duration,
    /// Status codes that justify another attempt.
    pub retryable_codes: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
            timeout_per_attempt: Duration::from_secs(30),
            retryable_codes: default_retryable_codes(),
        }
    }
}

impl RetryPolicy {
    /// Backoff for 0-based attempt `k`: `min(base * 2^k, max)`, then scaled by
    /// a jitter factor drawn uniformly from `[1 - jitter, 1 + jitter]` and
    /// clamped at zero.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt as i32);
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let unjittered_ms = (base_ms * exp).min(max_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let jittered_ms = (unjittered_ms * factor).max(0.0);
        Duration::from_secs_f64(jittered_ms / 1000.0)
    }

    /// True if `status` is in the retryable set.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_codes.contains(&status)
    }

    /// Total number of attempts this policy allows (`max_retries + 1`).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Outcome of a single retry attempt, as seen by `retry`.
pub enum AttemptOutcome<T> {
    /// The attempt succeeded; stop retrying.
    Success(T),
    /// The attempt failed with a status code that may or may not be retryable.
    Failed { status: Option<u16> },
}

/// Error returned when a retry loop exhausts its attempts.
#[derive(Debug, thiserror::Error)]
#[error("max retries reached after {attempts} attempts")]
pub struct MaxRetriesReached {
    /// Number of attempts actually made.
    pub attempts: u32,
}

/// Runs `attempt` up to `policy.max_attempts()` times, waiting
/// `policy.calculate_backoff(k)` between attempts. Stops early on success, on
/// a non-retryable status, or when `max_attempts` is reached.
///
/// `attempt` receives the 0-based attempt index and the per-attempt timeout
/// it should honor; it returns both the produced value and an
/// `AttemptOutcome` classification so the caller doesn't need to duplicate
/// status inspection logic here.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, MaxRetriesReached>
where
    F: FnMut(u32, Duration) -> Fut,
    Fut: std::future::Future<Output = AttemptOutcome<T>>,
{
    let max_attempts = policy.max_attempts();
    for k in 0..max_attempts {
        let outcome = attempt(k, policy.timeout_per_attempt).await;
        match outcome {
            AttemptOutcome::Success(value) => return Ok(value),
            AttemptOutcome::Failed { status } => {
                if let Some(status) = status {
                    if !policy.is_retryable_status(status) {
                        return Err(MaxRetriesReached { attempts: k + 1 });
                    }
                }
                let is_last = k + 1 == max_attempts;
                if is_last {
                    return Err(MaxRetriesReached { attempts: k + 1 });
                }
                tokio::time::sleep(policy.calculate_backoff(k)).await;
            }
        }
    }
    Err(MaxRetriesReached {
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_exponentially_and_caps_at_max_delay() {
        let policy = RetryPolicy {
            jitter: 0.0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(policy.calculate_backoff(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(400));
        // 100 * 2^3 = 800, capped at 500
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        for attempt in 0..5 {
            let d = policy.calculate_backoff(attempt);
            let base = 100.0 * 2f64.powi(attempt as i32);
            let lo = Duration::from_secs_f64((base * 0.8).max(0.0) / 1000.0);
            let hi = Duration::from_secs_f64((base * 1.2).min(5000.0) / 1000.0);
            assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} not in [{lo:?}, {hi:?}]");
        }
    }

    #[tokio::test]
    async fn s6_retries_until_success_within_retryable_set() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            retryable_codes: [503].into_iter().collect(),
            ..Default::default()
        };
        let responses = [503u16, 503, 200];
        let counter = AtomicU32::new(0);

        let result = retry(&policy, |_attempt, _timeout| {
            let i = counter.fetch_add(1, Ordering::SeqCst) as usize;
            let status = responses[i];
            async move {
                if status == 200 {
                    AttemptOutcome::Success(status)
                } else {
                    AttemptOutcome::Failed { status: Some(status) }
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 200);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn s6_exhausts_and_reports_max_retries_reached() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            retryable_codes: [503].into_iter().collect(),
            ..Default::default()
        };
        let counter = AtomicU32::new(0);

        let result: Result<(), MaxRetriesReached> = retry(&policy, |_attempt, _timeout| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { AttemptOutcome::<()>::Failed { status: Some(503) } }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_status_stops_immediately() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            retryable_codes: [503].into_iter().collect(),
            ..Default::default()
        };
        let counter = AtomicU32::new(0);

        let result: Result<(), MaxRetriesReached> = retry(&policy, |_attempt, _timeout| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { AttemptOutcome::<()>::Failed { status: Some(404) } }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
