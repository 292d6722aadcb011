use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{PipelineError, Result};
use crate::model::ServiceKind;

/// Fixed-window call counter. Calls over the budget are rejected right away
/// with the time left in the window; nothing is queued.
#[derive(Debug)]
pub struct RateLimiter {
    service: ServiceKind,
    max_calls: u32,
    window: Duration,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub service: ServiceKind,
    pub max_calls: u32,
    pub window_secs: u64,
    pub used: u32,
}

impl RateLimiter {
    pub fn new(service: ServiceKind, max_calls: u32, window: Duration) -> Self {
        Self {
            service,
            max_calls,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn from_config(service: ServiceKind, cfg: &RateLimitConfig) -> Self {
        Self::new(service, cfg.max_calls, Duration::from_secs(cfg.window_secs))
    }

    pub fn try_acquire(&self) -> Result<()> {
        let mut w = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(w.started);
        if elapsed >= self.window {
            w.started = now;
            w.used = 0;
        }
        if w.used >= self.max_calls {
            let retry_after = self.window.saturating_sub(now.duration_since(w.started));
            debug!(service = %self.service, ?retry_after, "rate limited");
            return Err(PipelineError::RateLimited {
                service: self.service,
                retry_after,
            });
        }
        w.used += 1;
        Ok(())
    }

    /// Whether a call would be admitted right now, without using it up.
    pub fn check(&self) -> Result<()> {
        let w = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = w.started.elapsed();
        if elapsed >= self.window || w.used < self.max_calls {
            return Ok(());
        }
        Err(PipelineError::RateLimited {
            service: self.service,
            retry_after: self.window.saturating_sub(elapsed),
        })
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let w = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let used = if w.started.elapsed() >= self.window {
            0
        } else {
            w.used
        };
        LimiterSnapshot {
            service: self.service,
            max_calls: self.max_calls,
            window_secs: self.window.as_secs(),
            used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rejects_over_budget_until_window_rolls() {
        let limiter = RateLimiter::new(ServiceKind::Caption, 2, Duration::from_secs(60));
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        match limiter.try_acquire() {
            Err(PipelineError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(40))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(limiter.snapshot().used, 2);

        tokio::time::advance(Duration::from_secs(40)).await;
        limiter.try_acquire().unwrap();
        assert_eq!(limiter.snapshot().used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_does_not_use_up_the_window() {
        let limiter = RateLimiter::new(ServiceKind::Render, 1, Duration::from_secs(10));
        for _ in 0..3 {
            limiter.check().unwrap();
        }
        assert_eq!(limiter.snapshot().used, 0);

        limiter.try_acquire().unwrap();
        assert!(matches!(limiter.check(), Err(PipelineError::RateLimited { .. })));

        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.check().unwrap();
    }
}
