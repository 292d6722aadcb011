//! Workflow record store.
//!
//! Every mutation is a compare-and-set on the stage the caller expects the
//! record to be in. A `false` return means somebody else already moved the
//! record, which callers treat as "already handled".

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::instrument;
use uuid::Uuid;

use super::Pool;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::model::{ServiceKind, WorkflowRecord, WorkflowStage};

const COLUMNS: &str = "id, idempotency_key, brand, content_item_id, stage, render_job_id, caption_job_id, \
     schedule_job_id, render_url, caption_url, post_url, render_attempts, caption_attempts, \
     schedule_attempts, script_title, script_caption, error_kind, error_detail, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewWorkflow<'a> {
    pub id: &'a str,
    pub idempotency_key: &'a str,
    pub brand: &'a str,
    pub content_item_id: &'a str,
    pub stage: WorkflowStage,
    pub script_title: Option<&'a str>,
    pub script_caption: Option<&'a str>,
    pub error: Option<(ErrorKind, &'a str)>,
}

/// Most recent failure recorded for a brand.
#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub workflow_id: String,
    pub stage: WorkflowStage,
    pub kind: Option<ErrorKind>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

fn job_column(service: ServiceKind) -> &'static str {
    match service {
        ServiceKind::Render => "render_job_id",
        ServiceKind::Caption => "caption_job_id",
        ServiceKind::Schedule => "schedule_job_id",
    }
}

fn url_column(service: ServiceKind) -> &'static str {
    match service {
        ServiceKind::Render => "render_url",
        ServiceKind::Caption => "caption_url",
        ServiceKind::Schedule => "post_url",
    }
}

fn attempts_column(service: ServiceKind) -> &'static str {
    match service {
        ServiceKind::Render => "render_attempts",
        ServiceKind::Caption => "caption_attempts",
        ServiceKind::Schedule => "schedule_attempts",
    }
}

fn record_from_row(row: &SqliteRow) -> Result<WorkflowRecord> {
    let stage_str: String = row.try_get("stage")?;
    let stage = WorkflowStage::parse_stage(&stage_str).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown workflow stage {stage_str}").into())
    })?;
    let error_kind = row
        .try_get::<Option<String>, _>("error_kind")?
        .and_then(|k| ErrorKind::parse_kind(&k));
    Ok(WorkflowRecord {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        brand: row.try_get("brand")?,
        content_item_id: row.try_get("content_item_id")?,
        stage,
        render_job_id: row.try_get("render_job_id")?,
        caption_job_id: row.try_get("caption_job_id")?,
        schedule_job_id: row.try_get("schedule_job_id")?,
        render_url: row.try_get("render_url")?,
        caption_url: row.try_get("caption_url")?,
        post_url: row.try_get("post_url")?,
        render_attempts: row.try_get("render_attempts")?,
        caption_attempts: row.try_get("caption_attempts")?,
        schedule_attempts: row.try_get("schedule_attempts")?,
        script_title: row.try_get("script_title")?,
        script_caption: row.try_get("script_caption")?,
        error_kind,
        error_detail: row.try_get("error_detail")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Fresh workflow id (UUID v4).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Insert a new record. A second insert with the same idempotency key is
/// rejected with [`PipelineError::DuplicateWorkflow`] and the stored record is
/// left as it was.
#[instrument(skip_all, fields(key = new.idempotency_key))]
pub async fn insert(pool: &Pool, new: NewWorkflow<'_>) -> Result<WorkflowRecord> {
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO workflows (id, idempotency_key, brand, content_item_id, stage, script_title, \
         script_caption, error_kind, error_detail, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    );
    let res = sqlx::query(&sql)
        .bind(new.id)
        .bind(new.idempotency_key)
        .bind(new.brand)
        .bind(new.content_item_id)
        .bind(new.stage.as_str())
        .bind(new.script_title)
        .bind(new.script_caption)
        .bind(new.error.map(|(k, _)| k.as_str()))
        .bind(new.error.map(|(_, d)| d))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await;
    match res {
        Ok(row) => record_from_row(&row),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(PipelineError::DuplicateWorkflow {
                key: new.idempotency_key.to_string(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, id: &str) -> Result<Option<WorkflowRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM workflows WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_by_key(pool: &Pool, idempotency_key: &str) -> Result<Option<WorkflowRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM workflows WHERE idempotency_key = ?");
    let row = sqlx::query(&sql)
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Find the record that owns an external job id, and which service issued it.
#[instrument(skip_all)]
pub async fn find_by_job_id(
    pool: &Pool,
    job_id: &str,
) -> Result<Option<(WorkflowRecord, ServiceKind)>> {
    for service in ServiceKind::ALL {
        let sql = format!(
            "SELECT {COLUMNS} FROM workflows WHERE {} = ? LIMIT 1",
            job_column(service)
        );
        if let Some(row) = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await? {
            return Ok(Some((record_from_row(&row)?, service)));
        }
    }
    Ok(None)
}

/// Store an accepted job id and move the record into that service's stage.
/// Only applies while the record is still in `expected` with no job id for
/// the service.
#[instrument(skip_all, fields(workflow_id = id, %service))]
pub async fn mark_submitted(
    pool: &Pool,
    id: &str,
    expected: WorkflowStage,
    service: ServiceKind,
    job_id: &str,
    attempts: u32,
) -> Result<bool> {
    let sql = format!(
        "UPDATE workflows SET stage = ?, {job} = ?, {att} = {att} + ?, error_kind = NULL, \
         error_detail = NULL, updated_at = ? WHERE id = ? AND stage = ? AND {job} IS NULL",
        job = job_column(service),
        att = attempts_column(service),
    );
    let res = sqlx::query(&sql)
        .bind(service.processing_stage().as_str())
        .bind(job_id)
        .bind(attempts as i64)
        .bind(Utc::now())
        .bind(id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Move a record from `from` to the next stage after a successful job,
/// storing the job's result url.
#[instrument(skip_all, fields(workflow_id = id))]
pub async fn advance(
    pool: &Pool,
    id: &str,
    from: WorkflowStage,
    to: WorkflowStage,
    result_url: Option<&str>,
) -> Result<bool> {
    let Some(service) = from.service() else {
        return Ok(false);
    };
    let sql = format!(
        "UPDATE workflows SET stage = ?, {} = ?, updated_at = ? WHERE id = ? AND stage = ?",
        url_column(service)
    );
    let res = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(result_url)
        .bind(Utc::now())
        .bind(id)
        .bind(from.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Move a record into a terminal stage (`failed` or `skipped`) with an error.
#[instrument(skip_all, fields(workflow_id = id))]
pub async fn finish_with_error(
    pool: &Pool,
    id: &str,
    expected: WorkflowStage,
    terminal: WorkflowStage,
    kind: ErrorKind,
    detail: &str,
) -> Result<bool> {
    debug_assert!(terminal.is_terminal());
    let res = sqlx::query(
        "UPDATE workflows SET stage = ?, error_kind = ?, error_detail = ?, updated_at = ? \
         WHERE id = ? AND stage = ?",
    )
    .bind(terminal.as_str())
    .bind(kind.as_str())
    .bind(detail)
    .bind(Utc::now())
    .bind(id)
    .bind(expected.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Record a non-fatal error (a deferred submission) and the attempts it used,
/// without changing the stage.
#[instrument(skip_all, fields(workflow_id = id))]
pub async fn note_deferral(
    pool: &Pool,
    id: &str,
    expected: WorkflowStage,
    service: ServiceKind,
    kind: ErrorKind,
    detail: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE workflows SET error_kind = ?, error_detail = ?, updated_at = ? WHERE id = ? AND stage = ?",
    )
    .bind(kind.as_str())
    .bind(format!("{service} deferred: {detail}"))
    .bind(Utc::now())
    .bind(id)
    .bind(expected.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Add attempts spent on a submission that did not produce a job id. A
/// record that has already reached a terminal stage is left alone.
#[instrument(skip_all, fields(workflow_id = id))]
pub async fn add_attempts(pool: &Pool, id: &str, service: ServiceKind, attempts: u32) -> Result<bool> {
    let sql = format!(
        "UPDATE workflows SET {att} = {att} + ?, updated_at = ? \
         WHERE id = ? AND stage NOT IN ('completed', 'failed', 'skipped')",
        att = attempts_column(service)
    );
    let res = sqlx::query(&sql)
        .bind(attempts as i64)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Every record that has not reached a terminal stage, oldest first.
#[instrument(skip_all)]
pub async fn list_open(pool: &Pool) -> Result<Vec<WorkflowRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM workflows \
         WHERE stage NOT IN ('completed', 'failed', 'skipped') \
         ORDER BY created_at ASC"
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(record_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_recent(pool: &Pool, brand: &str, limit: i64) -> Result<Vec<WorkflowRecord>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM workflows WHERE brand = ? ORDER BY created_at DESC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(brand)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_by_stage(pool: &Pool, brand: &str) -> Result<BTreeMap<String, i64>> {
    let rows = sqlx::query("SELECT stage, COUNT(*) AS n FROM workflows WHERE brand = ? GROUP BY stage")
        .bind(brand)
        .fetch_all(pool)
        .await?;
    let mut counts: BTreeMap<String, i64> = WorkflowStage::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for row in rows {
        counts.insert(row.try_get("stage")?, row.try_get("n")?);
    }
    Ok(counts)
}

#[instrument(skip_all)]
pub async fn last_error(pool: &Pool, brand: &str) -> Result<Option<LastError>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM workflows WHERE brand = ? AND error_detail IS NOT NULL \
         ORDER BY updated_at DESC LIMIT 1"
    );
    let row = sqlx::query(&sql).bind(brand).fetch_optional(pool).await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let rec = record_from_row(&row)?;
    Ok(Some(LastError {
        workflow_id: rec.id,
        stage: rec.stage,
        kind: rec.error_kind,
        detail: rec.error_detail,
        at: rec.updated_at,
    }))
}
