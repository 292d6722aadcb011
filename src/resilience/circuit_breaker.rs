//! Per-service circuit breaker.
//!
//! Closed lets everything through and counts consecutive failures. At the
//! threshold it opens and fails fast. Once the cooldown has elapsed a single
//! trial call is admitted (half-open); its result either closes the circuit or
//! re-opens it with a fresh timestamp.

use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::{PipelineError, Result};
use crate::model::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: ServiceKind,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_for_secs: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    service: ServiceKind,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: ServiceKind, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            service,
            failure_threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(service: ServiceKind, cfg: &BreakerConfig) -> Self {
        Self::new(
            service,
            cfg.failure_threshold,
            Duration::from_secs(cfg.cooldown_secs),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            service: self.service,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for_secs: inner.opened_at.map(|at| at.elapsed().as_secs()),
        }
    }

    /// Ask to make a call. The returned permit must be settled with
    /// [`BreakerPermit::success`] or [`BreakerPermit::failure`]; dropping it
    /// unsettled gives a half-open trial slot back.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if !cooled {
                    return Err(PipelineError::CircuitOpen {
                        service: self.service,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(service = %self.service, "circuit half-open, admitting trial call");
                Ok(BreakerPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(PipelineError::CircuitOpen {
                        service: self.service,
                    });
                }
                inner.trial_in_flight = true;
                Ok(BreakerPermit::new(self, true))
            }
        }
    }

    /// Whether [`try_acquire`](Self::try_acquire) would admit a call right
    /// now. Takes no trial slot.
    pub fn check(&self) -> Result<()> {
        let inner = self.lock();
        let admits = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.cooldown),
            CircuitState::HalfOpen => !inner.trial_in_flight,
        };
        if admits {
            Ok(())
        } else {
            Err(PipelineError::CircuitOpen {
                service: self.service,
            })
        }
    }

    /// Gate a single operation. Only errors for which `counts` returns true
    /// are held against the circuit.
    pub async fn call<T, F, Fut>(&self, counts: impl Fn(&PipelineError) -> bool, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        match &result {
            Err(err) if counts(err) => permit.failure(),
            _ => permit.success(),
        }
        result
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(service = %self.service, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(service = %self.service, "trial call failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
#[must_use = "settle the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
