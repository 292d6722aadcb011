use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

use super::Pool;
use crate::error::Result;
use crate::model::{QueueEntry, QueueStatus};

const ENTRY_COLUMNS: &str = "id, brand, content_item_id, position, status, skipped, cycle_count, \
     dispatch_count, last_processed_at, added_at";

/// Counts for one brand partition, plus the entry `next` would hand out.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub skipped: i64,
    pub next: Option<QueueEntry>,
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let status_str: String = row.try_get("status")?;
    let status = QueueStatus::parse_status(&status_str).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown queue status {status_str}").into())
    })?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        brand: row.try_get("brand")?,
        content_item_id: row.try_get("content_item_id")?,
        position: row.try_get("position")?,
        status,
        skipped: row.try_get::<i64, _>("skipped")? != 0,
        cycle_count: row.try_get("cycle_count")?,
        dispatch_count: row.try_get("dispatch_count")?,
        last_processed_at: row.try_get::<Option<DateTime<Utc>>, _>("last_processed_at")?,
        added_at: row.try_get("added_at")?,
    })
}

/// Append an entry at the tail of the brand's partition. Returns false if the
/// item already has an entry.
#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, brand: &str, content_item_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO rotation_queue (brand, content_item_id, position, status, added_at) \
         VALUES (?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM rotation_queue WHERE brand = ?), 'queued', ?)",
    )
    .bind(brand)
    .bind(content_item_id)
    .bind(brand)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Claim the oldest queued entry. One statement, so two concurrent callers can
/// never claim the same row.
#[instrument(skip_all)]
pub async fn claim_next(pool: &Pool, brand: &str) -> Result<Option<QueueEntry>> {
    let sql = format!(
        "UPDATE rotation_queue SET status = 'processing', dispatch_count = dispatch_count + 1 \
         WHERE status = 'queued' AND skipped = 0 AND id = ( \
             SELECT id FROM rotation_queue WHERE brand = ? AND status = 'queued' AND skipped = 0 \
             ORDER BY position ASC LIMIT 1) \
         RETURNING {ENTRY_COLUMNS}"
    );
    let row = sqlx::query(&sql).bind(brand).fetch_optional(pool).await?;
    row.as_ref().map(entry_from_row).transpose()
}

/// `processing -> completed`, bumping the cycle count. A no-op for entries
/// that are not processing.
#[instrument(skip_all)]
pub async fn mark_completed(
    pool: &Pool,
    brand: &str,
    content_item_id: &str,
    at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE rotation_queue SET status = 'completed', cycle_count = cycle_count + 1, last_processed_at = ? \
         WHERE brand = ? AND content_item_id = ? AND status = 'processing'",
    )
    .bind(at)
    .bind(brand)
    .bind(content_item_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// `processing -> queued`. With `skip` set the entry sits out the rest of the
/// cycle and counts as done for [`reset_cycle`].
#[instrument(skip_all)]
pub async fn requeue(pool: &Pool, brand: &str, content_item_id: &str, skip: bool) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE rotation_queue SET status = 'queued', skipped = ? \
         WHERE brand = ? AND content_item_id = ? AND status = 'processing'",
    )
    .bind(skip as i64)
    .bind(brand)
    .bind(content_item_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Start a new cycle if nothing is left to hand out and nothing is in flight.
/// Positions are untouched. Returns the number of entries flipped back.
#[instrument(skip_all)]
pub async fn reset_cycle(pool: &Pool, brand: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE rotation_queue SET status = 'queued', skipped = 0 \
         WHERE brand = ? AND (status = 'completed' OR skipped = 1) \
         AND NOT EXISTS ( \
             SELECT 1 FROM rotation_queue WHERE brand = ? \
             AND (status = 'processing' OR (status = 'queued' AND skipped = 0)))",
    )
    .bind(brand)
    .bind(brand)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Apply a reconciliation diff in one transaction: `add` is appended in order,
/// `remove` is deleted unless the entry has been claimed in the meantime.
#[instrument(skip_all)]
pub async fn apply_diff(pool: &Pool, brand: &str, add: &[String], remove: &[String]) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await?;
    let mut added = 0;
    for item_id in add {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO rotation_queue (brand, content_item_id, position, status, added_at) \
             VALUES (?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM rotation_queue WHERE brand = ?), 'queued', ?)",
        )
        .bind(brand)
        .bind(item_id)
        .bind(brand)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        added += res.rows_affected();
    }
    let mut removed = 0;
    for item_id in remove {
        let res = sqlx::query(
            "DELETE FROM rotation_queue WHERE brand = ? AND content_item_id = ? AND status != 'processing'",
        )
            .bind(brand)
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        removed += res.rows_affected();
    }
    tx.commit().await?;
    Ok((added, removed))
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, brand: &str, content_item_id: &str) -> Result<Option<QueueEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM rotation_queue WHERE brand = ? AND content_item_id = ?"
    );
    let row = sqlx::query(&sql)
        .bind(brand)
        .bind(content_item_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entry_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list(pool: &Pool, brand: &str) -> Result<Vec<QueueEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM rotation_queue WHERE brand = ? ORDER BY position ASC"
    );
    let rows = sqlx::query(&sql).bind(brand).fetch_all(pool).await?;
    rows.iter().map(entry_from_row).collect()
}

#[instrument(skip_all)]
pub async fn stats(pool: &Pool, brand: &str) -> Result<QueueStats> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
                COALESCE(SUM(CASE WHEN status = 'queued' AND skipped = 0 THEN 1 ELSE 0 END), 0) AS queued, \
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing, \
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed, \
                COALESCE(SUM(CASE WHEN skipped = 1 THEN 1 ELSE 0 END), 0) AS skipped \
         FROM rotation_queue WHERE brand = ?",
    )
    .bind(brand)
    .fetch_one(pool)
    .await?;

    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM rotation_queue WHERE brand = ? AND status = 'queued' AND skipped = 0 \
         ORDER BY position ASC LIMIT 1"
    );
    let next = sqlx::query(&sql).bind(brand).fetch_optional(pool).await?;

    Ok(QueueStats {
        total: row.try_get("total")?,
        queued: row.try_get("queued")?,
        processing: row.try_get("processing")?,
        completed: row.try_get("completed")?,
        skipped: row.try_get("skipped")?,
        next: next.as_ref().map(entry_from_row).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn enqueue_is_unique_per_brand() {
        let pool = memory_pool().await.unwrap();
        assert!(enqueue(&pool, "ownerfi", "p1").await.unwrap());
        assert!(!enqueue(&pool, "ownerfi", "p1").await.unwrap());
        assert!(enqueue(&pool, "carz", "p1").await.unwrap());
        assert_eq!(list(&pool, "ownerfi").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_next_marks_processing_and_counts_dispatch() {
        let pool = memory_pool().await.unwrap();
        enqueue(&pool, "ownerfi", "p1").await.unwrap();
        let entry = claim_next(&pool, "ownerfi").await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Processing);
        assert_eq!(entry.dispatch_count, 1);
        assert!(claim_next(&pool, "ownerfi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_completed_only_from_processing() {
        let pool = memory_pool().await.unwrap();
        enqueue(&pool, "ownerfi", "p1").await.unwrap();
        assert!(!mark_completed(&pool, "ownerfi", "p1", Utc::now()).await.unwrap());
        claim_next(&pool, "ownerfi").await.unwrap();
        assert!(mark_completed(&pool, "ownerfi", "p1", Utc::now()).await.unwrap());
        assert!(!mark_completed(&pool, "ownerfi", "p1", Utc::now()).await.unwrap());
        let entry = get(&pool, "ownerfi", "p1").await.unwrap().unwrap();
        assert_eq!(entry.cycle_count, 1);
        assert!(entry.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn stats_counts_each_bucket() {
        let pool = memory_pool().await.unwrap();
        for id in ["a", "b", "c", "d"] {
            enqueue(&pool, "ownerfi", id).await.unwrap();
        }
        claim_next(&pool, "ownerfi").await.unwrap(); // a
        mark_completed(&pool, "ownerfi", "a", Utc::now()).await.unwrap();
        claim_next(&pool, "ownerfi").await.unwrap(); // b
        requeue(&pool, "ownerfi", "b", true).await.unwrap();
        claim_next(&pool, "ownerfi").await.unwrap(); // c

        let s = stats(&pool, "ownerfi").await.unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.completed, 1);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.processing, 1);
        assert_eq!(s.queued, 1);
        assert_eq!(s.next.unwrap().content_item_id, "d");
    }

    #[tokio::test]
    async fn apply_diff_keeps_claimed_entries() {
        let pool = memory_pool().await.unwrap();
        enqueue(&pool, "ownerfi", "a").await.unwrap();
        enqueue(&pool, "ownerfi", "b").await.unwrap();
        // Claimed after the caller decided both should go.
        claim_next(&pool, "ownerfi").await.unwrap(); // a

        let remove = vec!["a".to_string(), "b".to_string()];
        let (added, removed) = apply_diff(&pool, "ownerfi", &["c".to_string()], &remove)
            .await
            .unwrap();
        assert_eq!((added, removed), (1, 1));

        let ids: Vec<_> = list(&pool, "ownerfi")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content_item_id)
            .collect();
        assert_eq!(ids, ["a", "c"]);
    }
}
