use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::Result;

const BACKOFF_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = BACKOFF_FACTOR.powi(attempt.saturating_sub(1).min(30) as i32);
        let ms = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay after the `attempt`-th failure with 0.9..1.1 jitter, never above `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.9..1.1);
        let ms = self.nominal_delay(attempt).as_millis() as f64 * jitter;
        Duration::from_millis(ms as u64).min(self.max_delay)
    }
}

/// Result of a retried operation plus the attempts it took. Zero attempts means
/// the call was blocked before reaching the transport.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    pub fn blocked(err: crate::error::PipelineError) -> Self {
        Self {
            result: Err(err),
            attempts: 0,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => {
                return Attempted {
                    result: Ok(v),
                    attempts: attempt,
                }
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(attempt, ?delay, error = %err, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::model::ServiceKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn nominal_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.nominal_delay(1), Duration::from_secs(1));
        assert_eq!(p.nominal_delay(2), Duration::from_secs(2));
        assert_eq!(p.nominal_delay(3), Duration::from_secs(4));
        assert_eq!(p.nominal_delay(12), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = policy();
        for _ in 0..100 {
            let d = p.delay(2).as_millis();
            assert!((1800..2200).contains(&d), "delay {d}ms out of band");
        }
        assert!(p.delay(20) <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = retry(&policy(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::transient(ServiceKind::Render, "503"))
                } else {
                    Ok("job-1")
                }
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), "job-1");
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_stops_immediately() {
        let out: Attempted<()> = retry(&policy(), |_| async {
            Err(PipelineError::terminal(ServiceKind::Render, "422"))
        })
        .await;
        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(PipelineError::TerminalService { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let out: Attempted<()> = retry(&policy(), |_| async {
            Err(PipelineError::transient(ServiceKind::Caption, "timeout"))
        })
        .await;
        assert_eq!(out.attempts, 3);
        assert!(out.result.unwrap_err().is_retryable());
    }
}
