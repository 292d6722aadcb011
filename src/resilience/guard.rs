use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::circuit_breaker::CircuitBreaker;
use super::rate_limit::RateLimiter;
use super::retry::{retry, Attempted, RetryPolicy};
use crate::config::CostConfig;
use crate::cost::CostTracker;
use crate::error::{PipelineError, Result};
use crate::model::{CostEvent, ServiceKind};

/// Who a call is made for; copied onto every cost event.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub brand: &'a str,
    pub workflow_id: Option<&'a str>,
}

/// Rate limiter, breaker, retry, per-call timeout and cost recording for one
/// external service.
#[derive(Debug, Clone)]
pub struct ServiceGuard {
    service: ServiceKind,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
    pricing: CostConfig,
    costs: CostTracker,
}

impl ServiceGuard {
    pub fn new(
        service: ServiceKind,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        timeout: Duration,
        pricing: CostConfig,
        costs: CostTracker,
    ) -> Self {
        Self {
            service,
            limiter,
            breaker,
            retry,
            timeout,
            pricing,
            costs,
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn pricing(&self) -> &CostConfig {
        &self.pricing
    }

    /// Rate limit, then breaker, then the retry loop around `op`. Calls
    /// rejected by the limiter or the breaker never reach `op` and cost
    /// nothing. Every attempt that ran records one cost event.
    #[instrument(skip_all, fields(service = %self.service, brand = ctx.brand))]
    pub async fn call<T, F, Fut>(&self, ctx: CallContext<'_>, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Err(err) = self.limiter.try_acquire() {
            return Attempted::blocked(err);
        }
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => return Attempted::blocked(err),
        };

        let out = retry(&self.retry, |attempt| {
            let fut = op();
            async move {
                let result = self.timed(fut).await;
                self.record_attempt(ctx, result.is_ok()).await;
                if let Err(err) = &result {
                    debug!(attempt, error = %err, "attempt failed");
                }
                result
            }
        })
        .await;

        match &out.result {
            Err(err) if err.is_retryable() => permit.failure(),
            _ => permit.success(),
        }
        out
    }

    /// Whether the limiter and the breaker would let a call through now.
    /// Consumes nothing; a later [`call`](Self::call) can still be blocked.
    pub fn ready(&self) -> Result<()> {
        self.limiter.check()?;
        self.breaker.check()
    }

    /// Single gated call without retries or cost, for status polling.
    pub async fn probe<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.limiter.try_acquire()?;
        self.breaker
            .call(PipelineError::is_retryable, || self.timed(fut))
            .await
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::transient(
                self.service,
                format!("call timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }

    async fn record_attempt(&self, ctx: CallContext<'_>, succeeded: bool) {
        let (units, cost_usd) = if succeeded || self.pricing.bill_failed_attempts {
            let units = self.pricing.units_per_call;
            (units, units * self.pricing.cost_per_unit_usd)
        } else {
            (0.0, 0.0)
        };
        self.costs
            .record(CostEvent {
                service: self.service,
                brand: ctx.brand.to_string(),
                operation: self.service.operation().to_string(),
                units,
                cost_usd,
                workflow_id: ctx.workflow_id.map(str::to_string),
                occurred_at: Utc::now(),
            })
            .await;
    }
}

/// One guard per stage service.
#[derive(Debug, Clone)]
pub struct Guards {
    pub render: ServiceGuard,
    pub caption: ServiceGuard,
    pub schedule: ServiceGuard,
}

impl Guards {
    pub fn get(&self, kind: ServiceKind) -> &ServiceGuard {
        match kind {
            ServiceKind::Render => &self.render,
            ServiceKind::Caption => &self.caption,
            ServiceKind::Schedule => &self.schedule,
        }
    }
}
