//! Per-brand rotation over the content backlog.
//!
//! Every eligible item is handed out once per cycle, oldest position first.
//! When nothing is left to hand out and nothing is in flight, the cycle resets
//! and the rotation starts again from the top in the same order.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, instrument};

use crate::db::queue::{self, QueueStats};
use crate::db::Pool;
use crate::error::Result;
use crate::model::{QueueEntry, QueueStatus};
use crate::services::SourceCatalog;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: u64,
    pub removed: u64,
}

#[derive(Debug, Clone)]
pub struct RotationQueue {
    pool: Pool,
}

impl RotationQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Claim the next entry for processing, if any.
    pub async fn next(&self, brand: &str) -> Result<Option<QueueEntry>> {
        queue::claim_next(&self.pool, brand).await
    }

    pub async fn complete(&self, brand: &str, content_item_id: &str) -> Result<bool> {
        queue::mark_completed(&self.pool, brand, content_item_id, chrono::Utc::now()).await
    }

    /// Returns how many entries were reset; 0 when the cycle is not finished.
    pub async fn reset_cycle(&self, brand: &str) -> Result<u64> {
        let n = queue::reset_cycle(&self.pool, brand).await?;
        if n > 0 {
            info!(brand, entries = n, "rotation cycle reset");
        }
        Ok(n)
    }

    /// Sit the entry out for the rest of this cycle after a validation failure.
    pub async fn reset_to_queued(&self, brand: &str, content_item_id: &str) -> Result<bool> {
        queue::requeue(&self.pool, brand, content_item_id, true).await
    }

    /// Give a claimed entry back untouched, e.g. when its first submission was deferred.
    pub async fn release(&self, brand: &str, content_item_id: &str) -> Result<bool> {
        queue::requeue(&self.pool, brand, content_item_id, false).await
    }

    /// Bring the partition in line with the catalog: new eligible items go to
    /// the tail in catalog order, entries for items that are gone or no longer
    /// eligible are removed. Entries in flight are left for the next pass.
    #[instrument(skip_all, fields(brand = %brand))]
    pub async fn reconcile(&self, brand: &str, catalog: &dyn SourceCatalog) -> Result<ReconcileReport> {
        let eligible = catalog.list_eligible_items(brand).await?;
        let existing = queue::list(&self.pool, brand).await?;

        let known: HashSet<&str> = existing.iter().map(|e| e.content_item_id.as_str()).collect();
        let wanted: HashSet<&str> = eligible.iter().map(|i| i.id.as_str()).collect();

        let mut seen = HashSet::new();
        let add: Vec<String> = eligible
            .iter()
            .filter(|i| !known.contains(i.id.as_str()) && seen.insert(i.id.as_str()))
            .map(|i| i.id.clone())
            .collect();
        let remove: Vec<String> = existing
            .iter()
            .filter(|e| {
                !wanted.contains(e.content_item_id.as_str()) && e.status != QueueStatus::Processing
            })
            .map(|e| e.content_item_id.clone())
            .collect();

        if add.is_empty() && remove.is_empty() {
            return Ok(ReconcileReport::default());
        }
        let (added, removed) = queue::apply_diff(&self.pool, brand, &add, &remove).await?;
        info!(brand, added, removed, "queue reconciled");
        Ok(ReconcileReport { added, removed })
    }

    pub async fn stats(&self, brand: &str) -> Result<QueueStats> {
        queue::stats(&self.pool, brand).await
    }

    pub async fn entries(&self, brand: &str) -> Result<Vec<QueueEntry>> {
        queue::list(&self.pool, brand).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::model::ContentItem;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticCatalog(Mutex<Vec<ContentItem>>);

    impl StaticCatalog {
        fn new(ids: &[&str]) -> Self {
            let items = ids.iter().map(|id| item(id, true)).collect();
            Self(Mutex::new(items))
        }

        fn set(&self, items: Vec<ContentItem>) {
            *self.0.lock().unwrap() = items;
        }
    }

    fn item(id: &str, eligible: bool) -> ContentItem {
        ContentItem {
            id: id.into(),
            label: format!("Item {id}"),
            brand: "ownerfi".into(),
            eligible,
            attributes: Default::default(),
        }
    }

    #[async_trait]
    impl SourceCatalog for StaticCatalog {
        async fn list_eligible_items(&self, brand: &str) -> Result<Vec<ContentItem>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|i| i.brand == brand && i.eligible)
                .cloned()
                .collect())
        }

        async fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
            Ok(self.0.lock().unwrap().iter().find(|i| i.id == id).cloned())
        }
    }

    async fn queue_with(ids: &[&str]) -> RotationQueue {
        let q = RotationQueue::new(memory_pool().await.unwrap());
        q.reconcile("ownerfi", &StaticCatalog::new(ids)).await.unwrap();
        q
    }

    fn order(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.content_item_id.as_str()).collect()
    }

    #[tokio::test]
    async fn two_item_rotation_cycles_in_order() {
        let q = queue_with(&["A", "B"]).await;

        let a = q.next("ownerfi").await.unwrap().unwrap();
        assert_eq!(a.content_item_id, "A");
        assert!(q.complete("ownerfi", "A").await.unwrap());

        let b = q.next("ownerfi").await.unwrap().unwrap();
        assert_eq!(b.content_item_id, "B");
        assert!(q.complete("ownerfi", "B").await.unwrap());

        assert!(q.next("ownerfi").await.unwrap().is_none());
        assert_eq!(q.reset_cycle("ownerfi").await.unwrap(), 2);

        let again = q.next("ownerfi").await.unwrap().unwrap();
        assert_eq!(again.content_item_id, "A");
        assert_eq!(again.cycle_count, 1);
        assert_eq!(again.dispatch_count, 2);
    }

    #[tokio::test]
    async fn completing_twice_counts_once() {
        let q = queue_with(&["A"]).await;
        q.next("ownerfi").await.unwrap();
        assert!(q.complete("ownerfi", "A").await.unwrap());
        assert!(!q.complete("ownerfi", "A").await.unwrap());
        let entries = q.entries("ownerfi").await.unwrap();
        assert_eq!(entries[0].cycle_count, 1);
    }

    #[tokio::test]
    async fn reset_is_noop_while_work_remains() {
        let q = queue_with(&["A", "B", "C"]).await;
        q.next("ownerfi").await.unwrap();
        q.complete("ownerfi", "A").await.unwrap();

        // B and C still queued.
        assert_eq!(q.reset_cycle("ownerfi").await.unwrap(), 0);

        // B in flight, C queued.
        q.next("ownerfi").await.unwrap();
        assert_eq!(q.reset_cycle("ownerfi").await.unwrap(), 0);
        let entries = q.entries("ownerfi").await.unwrap();
        assert_eq!(order(&entries), vec!["A", "B", "C"]);
        assert_eq!(entries[0].status, QueueStatus::Completed);
        assert_eq!(entries[1].status, QueueStatus::Processing);
    }

    #[tokio::test]
    async fn skipped_entry_sits_out_until_reset() {
        let q = queue_with(&["A", "B"]).await;
        q.next("ownerfi").await.unwrap();
        assert!(q.reset_to_queued("ownerfi", "A").await.unwrap());

        let b = q.next("ownerfi").await.unwrap().unwrap();
        assert_eq!(b.content_item_id, "B");
        q.complete("ownerfi", "B").await.unwrap();
        assert!(q.next("ownerfi").await.unwrap().is_none());

        assert_eq!(q.reset_cycle("ownerfi").await.unwrap(), 2);
        let entries = q.entries("ownerfi").await.unwrap();
        assert!(entries.iter().all(|e| !e.skipped && e.status == QueueStatus::Queued));
        // A was never completed.
        assert_eq!(entries[0].cycle_count, 0);
    }

    #[tokio::test]
    async fn release_puts_entry_back_at_its_position() {
        let q = queue_with(&["A", "B"]).await;
        q.next("ownerfi").await.unwrap();
        assert!(q.release("ownerfi", "A").await.unwrap());
        let again = q.next("ownerfi").await.unwrap().unwrap();
        assert_eq!(again.content_item_id, "A");
        assert_eq!(again.dispatch_count, 2);
    }

    #[tokio::test]
    async fn reconcile_appends_and_removes_without_reordering() {
        let catalog = StaticCatalog::new(&["A", "B", "C"]);
        let q = RotationQueue::new(memory_pool().await.unwrap());
        let first = q.reconcile("ownerfi", &catalog).await.unwrap();
        assert_eq!(first, ReconcileReport { added: 3, removed: 0 });

        catalog.set(vec![
            item("D", true),
            item("C", true),
            item("B", false),
            item("A", true),
        ]);
        let report = q.reconcile("ownerfi", &catalog).await.unwrap();
        assert_eq!(report, ReconcileReport { added: 1, removed: 1 });

        let entries = q.entries("ownerfi").await.unwrap();
        assert_eq!(order(&entries), vec!["A", "C", "D"]);

        // Second pass over an unchanged catalog does nothing.
        let report = q.reconcile("ownerfi", &catalog).await.unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn reconcile_keeps_in_flight_entries() {
        let catalog = StaticCatalog::new(&["A", "B"]);
        let q = RotationQueue::new(memory_pool().await.unwrap());
        q.reconcile("ownerfi", &catalog).await.unwrap();
        q.next("ownerfi").await.unwrap();

        catalog.set(vec![item("B", true)]);
        let report = q.reconcile("ownerfi", &catalog).await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(q.complete("ownerfi", "A").await.unwrap());

        let report = q.reconcile("ownerfi", &catalog).await.unwrap();
        assert_eq!(report.removed, 1);
    }
}
