//! Cost ledger and budget evaluation.
//!
//! The tracker observes spend; it never blocks a call on its own. Callers that
//! want enforcement ask [`CostTracker::can_afford`] before submitting.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::Budgets;
use crate::db::costs::{self, Spend};
use crate::db::Pool;
use crate::error::Result;
use crate::model::{CostEvent, ServiceKind};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BudgetStatus {
    pub service: ServiceKind,
    pub period: BudgetPeriod,
    pub used_units: f64,
    pub used_cost_usd: f64,
    pub limit_units: f64,
    pub percentage: f64,
    pub near_limit: bool,
    pub critical: bool,
    pub exceeded: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Affordability {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonthlyBreakdown {
    pub by_service: BTreeMap<String, Spend>,
    pub by_brand: BTreeMap<String, Spend>,
    pub total: Spend,
}

/// Everything the status endpoint shows about spend.
#[derive(Debug, Clone, Serialize)]
pub struct CostSnapshot {
    pub daily: BTreeMap<String, Spend>,
    pub month: MonthlyBreakdown,
    pub projected_month_usd: f64,
    pub budgets: Vec<BudgetStatus>,
}

#[derive(Debug, Clone)]
pub struct CostTracker {
    pool: Pool,
    budgets: Budgets,
}

impl CostTracker {
    pub fn new(pool: Pool, budgets: Budgets) -> Self {
        Self { pool, budgets }
    }

    /// Append a cost event. Storage failures are logged and swallowed so the
    /// pipeline never fails because of bookkeeping.
    pub async fn record(&self, event: CostEvent) {
        match costs::insert(&self.pool, &event).await {
            Ok(()) => info!(
                service = %event.service,
                brand = %event.brand,
                operation = %event.operation,
                units = event.units,
                cost_usd = event.cost_usd,
                "cost recorded"
            ),
            Err(err) => warn!(?err, service = %event.service, "failed to record cost event"),
        }
    }

    pub async fn daily_spend(&self, service: ServiceKind) -> Result<Spend> {
        self.daily_spend_at(service, Utc::now()).await
    }

    pub async fn daily_spend_at(&self, service: ServiceKind, now: DateTime<Utc>) -> Result<Spend> {
        let (from, to) = day_bounds(now);
        costs::sum_between(&self.pool, from, to, Some(service)).await
    }

    pub async fn month_spend(&self) -> Result<Spend> {
        self.month_spend_at(Utc::now()).await
    }

    pub async fn month_spend_at(&self, now: DateTime<Utc>) -> Result<Spend> {
        let (from, to) = month_bounds(now);
        costs::sum_between(&self.pool, from, to, None).await
    }

    pub async fn monthly_breakdown_at(&self, now: DateTime<Utc>) -> Result<MonthlyBreakdown> {
        let (from, to) = month_bounds(now);
        let rows = costs::breakdown_between(&self.pool, from, to).await?;
        let mut out = MonthlyBreakdown::default();
        for (service, brand, spend) in rows {
            accumulate(out.by_service.entry(service).or_default(), spend);
            accumulate(out.by_brand.entry(brand).or_default(), spend);
            accumulate(&mut out.total, spend);
        }
        Ok(out)
    }

    /// Usage against the configured unit limit, or `None` when the service has
    /// no limit for the period.
    pub async fn budget_status(
        &self,
        service: ServiceKind,
        period: BudgetPeriod,
    ) -> Result<Option<BudgetStatus>> {
        self.budget_status_at(service, period, Utc::now()).await
    }

    pub async fn budget_status_at(
        &self,
        service: ServiceKind,
        period: BudgetPeriod,
        now: DateTime<Utc>,
    ) -> Result<Option<BudgetStatus>> {
        let limits = match period {
            BudgetPeriod::Daily => &self.budgets.daily_units,
            BudgetPeriod::Monthly => &self.budgets.monthly_units,
        };
        let Some(limit) = limits.get(&service).copied() else {
            return Ok(None);
        };
        let (from, to) = match period {
            BudgetPeriod::Daily => day_bounds(now),
            BudgetPeriod::Monthly => month_bounds(now),
        };
        let used = costs::sum_between(&self.pool, from, to, Some(service)).await?;
        Ok(Some(evaluate(
            service,
            period,
            used,
            limit,
            self.budgets.warning_percent,
            self.budgets.critical_percent,
        )))
    }

    pub async fn projected_monthly_spend(&self) -> Result<f64> {
        let now = Utc::now();
        let spend = self.month_spend_at(now).await?;
        Ok(project_month_end(spend.cost_usd, now))
    }

    /// Caller-side policy check: would `units` more of `service` stay within
    /// both the daily and the monthly unit budgets?
    pub async fn can_afford(&self, service: ServiceKind, units: f64) -> Result<Affordability> {
        let now = Utc::now();
        for period in [BudgetPeriod::Daily, BudgetPeriod::Monthly] {
            if let Some(status) = self.budget_status_at(service, period, now).await? {
                if status.used_units + units > status.limit_units {
                    return Ok(Affordability {
                        allowed: false,
                        reason: Some(format!(
                            "{:?} {} budget exhausted ({}/{} units)",
                            period, service, status.used_units, status.limit_units
                        )),
                    });
                }
            }
        }
        Ok(Affordability {
            allowed: true,
            reason: None,
        })
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<CostEvent>> {
        costs::recent(&self.pool, limit).await
    }

    pub async fn snapshot(&self) -> Result<CostSnapshot> {
        let now = Utc::now();
        let mut daily = BTreeMap::new();
        let mut budgets = Vec::new();
        for service in ServiceKind::ALL {
            daily.insert(
                service.as_str().to_string(),
                self.daily_spend_at(service, now).await?,
            );
            for period in [BudgetPeriod::Daily, BudgetPeriod::Monthly] {
                if let Some(status) = self.budget_status_at(service, period, now).await? {
                    budgets.push(status);
                }
            }
        }
        let month = self.monthly_breakdown_at(now).await?;
        let projected_month_usd = project_month_end(month.total.cost_usd, now);
        Ok(CostSnapshot {
            daily,
            month,
            projected_month_usd,
            budgets,
        })
    }
}

fn accumulate(into: &mut Spend, spend: Spend) {
    into.units += spend.units;
    into.cost_usd += spend.cost_usd;
}

fn evaluate(
    service: ServiceKind,
    period: BudgetPeriod,
    used: Spend,
    limit: f64,
    warning_percent: f64,
    critical_percent: f64,
) -> BudgetStatus {
    let percentage = if limit > 0.0 {
        used.units / limit * 100.0
    } else {
        0.0
    };
    BudgetStatus {
        service,
        period,
        used_units: used.units,
        used_cost_usd: used.cost_usd,
        limit_units: limit,
        percentage,
        near_limit: percentage >= warning_percent,
        critical: percentage >= critical_percent,
        exceeded: used.units >= limit,
    }
}

/// UTC day containing `now`, as `[start, end)`.
pub fn day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, start + ChronoDuration::days(1))
}

/// Calendar month containing `now`, as `[start, end)`.
pub fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (y, m) = (now.year(), now.month());
    let start = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single().unwrap_or(now);
    let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
    let end = Utc.with_ymd_and_hms(ny, nm, 1, 0, 0, 0).single().unwrap_or(now);
    (start, end)
}

/// Extend month-to-date spend at the current daily rate over the days left.
/// Today counts as an elapsed day.
pub fn project_month_end(month_to_date: f64, now: DateTime<Utc>) -> f64 {
    let (start, end) = month_bounds(now);
    let days_in_month = (end - start).num_days() as f64;
    let elapsed = f64::from(now.day());
    let daily_rate = month_to_date / elapsed;
    month_to_date + daily_rate * (days_in_month - elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{example, Config};
    use crate::db::memory_pool;

    fn budgets() -> Budgets {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.budgets
    }

    fn event(service: ServiceKind, brand: &str, units: f64, cost: f64, at: DateTime<Utc>) -> CostEvent {
        CostEvent {
            service,
            brand: brand.into(),
            operation: service.operation().into(),
            units,
            cost_usd: cost,
            workflow_id: None,
            occurred_at: at,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn projection_is_linear_over_remaining_days() {
        // 10 of 31 days elapsed in October, $100 spent.
        let projected = project_month_end(100.0, at(2026, 10, 10, 12));
        assert!((projected - 310.0).abs() < 1e-9);
        // Last day of the month: nothing left to extrapolate.
        assert!((project_month_end(42.0, at(2026, 2, 28, 23)) - 42.0).abs() < 1e-9);
    }

    #[test]
    fn bounds_cover_year_end() {
        let (start, end) = month_bounds(at(2026, 12, 15, 8));
        assert_eq!(start, at(2026, 12, 1, 0));
        assert_eq!(end, at(2027, 1, 1, 0));
        let (start, end) = day_bounds(at(2026, 12, 31, 23));
        assert_eq!(start, at(2026, 12, 31, 0));
        assert_eq!(end, at(2027, 1, 1, 0));
    }

    #[tokio::test]
    async fn aggregates_by_day_month_service_and_brand() {
        let pool = memory_pool().await.unwrap();
        let tracker = CostTracker::new(pool, budgets());
        let now = at(2026, 10, 18, 15);

        tracker.record(event(ServiceKind::Render, "ownerfi", 1.0, 0.5, at(2026, 10, 18, 1))).await;
        tracker.record(event(ServiceKind::Render, "carz", 1.0, 0.5, at(2026, 10, 18, 9))).await;
        tracker.record(event(ServiceKind::Caption, "ownerfi", 1.0, 0.25, at(2026, 10, 18, 10))).await;
        tracker.record(event(ServiceKind::Render, "ownerfi", 1.0, 0.5, at(2026, 10, 2, 10))).await;
        tracker.record(event(ServiceKind::Render, "ownerfi", 1.0, 0.5, at(2026, 9, 30, 10))).await;

        let day = tracker.daily_spend_at(ServiceKind::Render, now).await.unwrap();
        assert_eq!(day.units, 2.0);
        assert!((day.cost_usd - 1.0).abs() < 1e-9);

        let month = tracker.month_spend_at(now).await.unwrap();
        assert!((month.cost_usd - 1.75).abs() < 1e-9);

        let breakdown = tracker.monthly_breakdown_at(now).await.unwrap();
        assert_eq!(breakdown.by_service["render"].units, 3.0);
        assert!((breakdown.by_brand["ownerfi"].cost_usd - 1.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_status_flags_thresholds() {
        let pool = memory_pool().await.unwrap();
        let tracker = CostTracker::new(pool, budgets());
        let now = at(2026, 10, 18, 15);

        // Daily render limit is 50 units: 40 is 80%, right at the warning line.
        tracker.record(event(ServiceKind::Render, "ownerfi", 40.0, 20.0, now)).await;
        let status = tracker
            .budget_status_at(ServiceKind::Render, BudgetPeriod::Daily, now)
            .await
            .unwrap()
            .unwrap();
        assert!((status.percentage - 80.0).abs() < 1e-9);
        assert!(status.near_limit);
        assert!(!status.critical);
        assert!(!status.exceeded);

        tracker.record(event(ServiceKind::Render, "carz", 8.0, 4.0, now)).await;
        let status = tracker
            .budget_status_at(ServiceKind::Render, BudgetPeriod::Daily, now)
            .await
            .unwrap()
            .unwrap();
        assert!(status.critical);

        // No schedule budget configured.
        assert!(tracker
            .budget_status_at(ServiceKind::Schedule, BudgetPeriod::Daily, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn can_afford_checks_remaining_units() {
        let pool = memory_pool().await.unwrap();
        let tracker = CostTracker::new(pool, budgets());
        tracker
            .record(event(ServiceKind::Caption, "ownerfi", 50.0, 12.5, Utc::now()))
            .await;

        let verdict = tracker.can_afford(ServiceKind::Caption, 1.0).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("caption"));
        assert!(tracker.can_afford(ServiceKind::Render, 1.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn record_swallows_storage_errors() {
        let pool = memory_pool().await.unwrap();
        sqlx::query("DROP TABLE cost_events").execute(&pool).await.unwrap();
        let tracker = CostTracker::new(pool, budgets());
        // Must not panic or return an error.
        tracker
            .record(event(ServiceKind::Render, "ownerfi", 1.0, 0.5, Utc::now()))
            .await;
    }
}
