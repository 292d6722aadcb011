//! Resilience layer wrapped around every call to an external job service.
//!
//! - `rate_limit`: fixed-window limiter, rejects with `RateLimited`.
//! - `circuit_breaker`: closed/open/half-open breaker, rejects with `CircuitOpen`.
//! - `retry`: exponential backoff with jitter for transient failures.
//! - `guard`: composes the three, applies the per-call timeout and records cost.
//!
//! Breakers and limiters are process-wide per service. They live in a
//! [`ResilienceRegistry`] that is built once and handed to whoever needs it.

pub mod circuit_breaker;
pub mod guard;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use guard::{CallContext, Guards, ServiceGuard};
pub use rate_limit::{LimiterSnapshot, RateLimiter};
pub use retry::{retry, Attempted, RetryPolicy};

use serde::Serialize;
use std::sync::Arc;

use crate::config::Services;
use crate::cost::CostTracker;
use crate::model::ServiceKind;

#[derive(Debug)]
struct Slot {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Debug)]
pub struct ResilienceRegistry {
    services: Services,
    render: Slot,
    caption: Slot,
    schedule: Slot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResilienceSnapshot {
    pub breakers: Vec<BreakerSnapshot>,
    pub limiters: Vec<LimiterSnapshot>,
}

impl ResilienceRegistry {
    pub fn from_config(services: &Services) -> Self {
        let slot = |kind: ServiceKind| {
            let cfg = services.get(kind);
            Slot {
                limiter: Arc::new(RateLimiter::from_config(kind, &cfg.rate_limit)),
                breaker: Arc::new(CircuitBreaker::from_config(kind, &cfg.circuit_breaker)),
            }
        };
        Self {
            services: services.clone(),
            render: slot(ServiceKind::Render),
            caption: slot(ServiceKind::Caption),
            schedule: slot(ServiceKind::Schedule),
        }
    }

    fn slot(&self, kind: ServiceKind) -> &Slot {
        match kind {
            ServiceKind::Render => &self.render,
            ServiceKind::Caption => &self.caption,
            ServiceKind::Schedule => &self.schedule,
        }
    }

    pub fn breaker(&self, kind: ServiceKind) -> Arc<CircuitBreaker> {
        self.slot(kind).breaker.clone()
    }

    pub fn limiter(&self, kind: ServiceKind) -> Arc<RateLimiter> {
        self.slot(kind).limiter.clone()
    }

    /// Build the guard for one service. Guards share this registry's breaker
    /// and limiter, so every guard for a service sees the same state.
    pub fn guard(&self, kind: ServiceKind, costs: CostTracker) -> ServiceGuard {
        let cfg = self.services.get(kind);
        ServiceGuard::new(
            kind,
            self.limiter(kind),
            self.breaker(kind),
            RetryPolicy::from_config(&cfg.retry),
            cfg.timeout(),
            cfg.cost.clone(),
            costs,
        )
    }

    pub fn guards(&self, costs: &CostTracker) -> Guards {
        Guards {
            render: self.guard(ServiceKind::Render, costs.clone()),
            caption: self.guard(ServiceKind::Caption, costs.clone()),
            schedule: self.guard(ServiceKind::Schedule, costs.clone()),
        }
    }

    pub fn snapshot(&self) -> ResilienceSnapshot {
        ResilienceSnapshot {
            breakers: ServiceKind::ALL
                .iter()
                .map(|k| self.slot(*k).breaker.snapshot())
                .collect(),
            limiters: ServiceKind::ALL
                .iter()
                .map(|k| self.slot(*k).limiter.snapshot())
                .collect(),
        }
    }
}
