use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use super::Pool;
use crate::error::Result;
use crate::model::{CostEvent, ServiceKind};

/// Units and dollars summed over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct Spend {
    pub units: f64,
    pub cost_usd: f64,
}

#[instrument(skip_all, fields(service = %event.service, brand = %event.brand))]
pub async fn insert(pool: &Pool, event: &CostEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO cost_events (service, brand, operation, units, cost_usd, workflow_id, occurred_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.service.as_str())
    .bind(&event.brand)
    .bind(&event.operation)
    .bind(event.units)
    .bind(event.cost_usd)
    .bind(event.workflow_id.as_deref())
    .bind(event.occurred_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sum events in `[from, to)`, optionally for one service.
#[instrument(skip_all)]
pub async fn sum_between(
    pool: &Pool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    service: Option<ServiceKind>,
) -> Result<Spend> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(units), 0.0) AS units, COALESCE(SUM(cost_usd), 0.0) AS cost \
         FROM cost_events WHERE occurred_at >= ? AND occurred_at < ? AND (? IS NULL OR service = ?)",
    )
    .bind(from)
    .bind(to)
    .bind(service.map(|s| s.as_str()))
    .bind(service.map(|s| s.as_str()))
    .fetch_one(pool)
    .await?;
    Ok(Spend {
        units: row.try_get("units")?,
        cost_usd: row.try_get("cost")?,
    })
}

/// Per (service, brand) totals in `[from, to)`.
#[instrument(skip_all)]
pub async fn breakdown_between(
    pool: &Pool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<(String, String, Spend)>> {
    let rows = sqlx::query(
        "SELECT service, brand, SUM(units) AS units, SUM(cost_usd) AS cost FROM cost_events \
         WHERE occurred_at >= ? AND occurred_at < ? GROUP BY service, brand ORDER BY service, brand",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<(String, String, Spend)> {
            Ok((
                row.try_get("service")?,
                row.try_get("brand")?,
                Spend {
                    units: row.try_get("units")?,
                    cost_usd: row.try_get("cost")?,
                },
            ))
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn recent(pool: &Pool, limit: i64) -> Result<Vec<CostEvent>> {
    let rows = sqlx::query(
        "SELECT service, brand, operation, units, cost_usd, workflow_id, occurred_at FROM cost_events \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<CostEvent> {
            let service: String = row.try_get("service")?;
            let service = ServiceKind::parse_service(&service).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown service {service}").into())
            })?;
            Ok(CostEvent {
                service,
                brand: row.try_get("brand")?,
                operation: row.try_get("operation")?,
                units: row.try_get("units")?,
                cost_usd: row.try_get("cost_usd")?,
                workflow_id: row.try_get("workflow_id")?,
                occurred_at: row.try_get("occurred_at")?,
            })
        })
        .collect()
}
