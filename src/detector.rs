//! Completion detection for external jobs.
//!
//! Two paths report how a job ended: the service's webhook callback and a
//! polling task per outstanding job. Both hand the outcome to an
//! [`OutcomeSink`], whose stage compare-and-set makes sure only the first
//! report moves the record. Whichever path resolves a job first also stops
//! the polling task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{JobOutcome, ServiceKind, WorkflowStage};
use crate::resilience::Guards;
use crate::services::JobServices;

/// What applying an outcome did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No record owns the job id.
    Unknown,
    /// The record already moved past this job; nothing changed.
    AlreadyResolved,
    /// The record moved on to the next processing stage.
    Advanced(WorkflowStage),
    Completed,
    Failed,
    /// The next stage's payload failed validation; the item sits out the cycle.
    Skipped,
}

/// Applies job outcomes to workflow records.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn resolve(&self, service: ServiceKind, job_id: &str, outcome: JobOutcome) -> Result<Resolution>;
}

/// A job the detector is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub workflow_id: String,
    pub service: ServiceKind,
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
}

type WatchKey = (ServiceKind, String);

struct Watch {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct CompletionDetector {
    watches: Arc<Mutex<HashMap<WatchKey, Watch>>>,
    generation: Arc<AtomicU64>,
    root: CancellationToken,
    guards: Guards,
    services: JobServices,
    poll_interval: Duration,
    max_wait: Duration,
}

impl CompletionDetector {
    pub fn new(
        guards: Guards,
        services: JobServices,
        poll_interval: Duration,
        max_wait: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            watches: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            root,
            guards,
            services,
            poll_interval,
            max_wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WatchKey, Watch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start polling a job. Returns false if it is already being watched.
    /// The wait budget counts from `submitted_at`, so a job re-registered
    /// after a restart does not get a fresh one.
    pub fn watch(&self, job: PendingJob, sink: Arc<dyn OutcomeSink>) -> bool {
        let key = (job.service, job.job_id.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        {
            let mut watches = self.lock();
            if watches.contains_key(&key) {
                return false;
            }
            watches.insert(
                key.clone(),
                Watch {
                    generation,
                    token: token.clone(),
                },
            );
        }

        let waited = (Utc::now() - job.submitted_at).to_std().unwrap_or_default();
        let deadline = Instant::now() + self.max_wait.saturating_sub(waited);
        debug!(service = %job.service, job_id = %job.job_id, "watching job");

        let detector = self.clone();
        tokio::spawn(async move {
            detector.poll_until_resolved(&job, deadline, token, sink).await;
            detector.remove_if_current(&key, generation);
        });
        true
    }

    /// Stop polling a job. Returns false if it was not being watched.
    pub fn forget(&self, service: ServiceKind, job_id: &str) -> bool {
        match self.lock().remove(&(service, job_id.to_string())) {
            Some(watch) => {
                watch.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, service: ServiceKind, job_id: &str) -> bool {
        self.lock().contains_key(&(service, job_id.to_string()))
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn remove_if_current(&self, key: &WatchKey, generation: u64) {
        let mut watches = self.lock();
        if watches.get(key).is_some_and(|w| w.generation == generation) {
            watches.remove(key);
        }
    }

    async fn poll_until_resolved(
        &self,
        job: &PendingJob,
        deadline: Instant,
        token: CancellationToken,
        sink: Arc<dyn OutcomeSink>,
    ) {
        let guard = self.guards.get(job.service);
        let service = self.services.get(job.service).clone();
        loop {
            let nap = self
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(nap) => {}
            }

            let status = tokio::select! {
                _ = token.cancelled() => return,
                status = guard.probe(service.poll_status(&job.job_id)) => status,
            };
            let outcome = match status {
                Ok(status) => status.into_outcome(),
                Err(err) => {
                    debug!(service = %job.service, job_id = %job.job_id, error = %err, "poll failed");
                    None
                }
            };
            let outcome = match outcome {
                Some(outcome) => outcome,
                None if Instant::now() >= deadline => {
                    warn!(
                        service = %job.service,
                        job_id = %job.job_id,
                        workflow_id = %job.workflow_id,
                        "job did not complete in time"
                    );
                    JobOutcome::TimedOut {
                        waited: self.max_wait,
                    }
                }
                None => continue,
            };

            match sink.resolve(job.service, &job.job_id, outcome).await {
                Ok(resolution) => {
                    info!(service = %job.service, job_id = %job.job_id, ?resolution, "poll resolved job")
                }
                Err(err) => {
                    warn!(service = %job.service, job_id = %job.job_id, error = %err, "failed to apply polled outcome")
                }
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{example, Config};
    use crate::cost::CostTracker;
    use crate::db::memory_pool;
    use crate::resilience::ResilienceRegistry;
    use crate::services::{JobPayload, JobService, JobState, JobStatus};
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;

    /// Answers polls from a script; `Pending` once the script runs out.
    #[derive(Default)]
    struct ScriptedPolls {
        answers: AsyncMutex<VecDeque<JobStatus>>,
        polls: AtomicU64,
    }

    #[async_trait]
    impl JobService for ScriptedPolls {
        async fn submit(&self, _payload: &JobPayload) -> Result<String> {
            Ok("unused".into())
        }

        async fn poll_status(&self, _job_id: &str) -> Result<JobStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .answers
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(JobStatus::pending))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: AsyncMutex<Vec<(ServiceKind, String, JobOutcome)>>,
    }

    #[async_trait]
    impl OutcomeSink for RecordingSink {
        async fn resolve(&self, service: ServiceKind, job_id: &str, outcome: JobOutcome) -> Result<Resolution> {
            self.seen.lock().await.push((service, job_id.to_string(), outcome));
            Ok(Resolution::Completed)
        }
    }

    async fn detector(polls: Arc<ScriptedPolls>, max_wait: Duration) -> CompletionDetector {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let costs = CostTracker::new(memory_pool().await.unwrap(), cfg.budgets.clone());
        let guards = ResilienceRegistry::from_config(&cfg.services).guards(&costs);
        let services = JobServices {
            render: polls.clone(),
            caption: polls.clone(),
            schedule: polls,
        };
        CompletionDetector::new(
            guards,
            services,
            Duration::from_millis(10),
            max_wait,
            CancellationToken::new(),
        )
    }

    fn job(job_id: &str) -> PendingJob {
        PendingJob {
            workflow_id: "wf-1".into(),
            service: ServiceKind::Render,
            job_id: job_id.into(),
            submitted_at: Utc::now(),
        }
    }

    async fn wait_for_idle(d: &CompletionDetector) {
        for _ in 0..200 {
            if d.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("detector still has {} watches", d.pending());
    }

    #[tokio::test]
    async fn poll_reports_completion_once() {
        let polls = Arc::new(ScriptedPolls::default());
        polls.answers.lock().await.extend([
            JobStatus::pending(),
            JobStatus {
                status: JobState::Completed,
                result_url: Some("https://cdn.example.com/r.mp4".into()),
                error: None,
            },
        ]);
        let d = detector(polls.clone(), Duration::from_secs(5)).await;
        let sink = Arc::new(RecordingSink::default());

        assert!(d.watch(job("r-1"), sink.clone()));
        assert!(!d.watch(job("r-1"), sink.clone()));
        wait_for_idle(&d).await;

        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].2,
            JobOutcome::Completed {
                result_url: Some("https://cdn.example.com/r.mp4".into())
            }
        );
        assert_eq!(polls.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_with_timeout_outcome() {
        let polls = Arc::new(ScriptedPolls::default());
        let d = detector(polls, Duration::from_millis(50)).await;
        let sink = Arc::new(RecordingSink::default());

        d.watch(job("r-slow"), sink.clone());
        wait_for_idle(&d).await;

        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0].2, JobOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn forget_cancels_the_poll_task() {
        let polls = Arc::new(ScriptedPolls::default());
        let d = detector(polls, Duration::from_secs(5)).await;
        let sink = Arc::new(RecordingSink::default());

        d.watch(job("r-2"), sink.clone());
        assert!(d.is_watching(ServiceKind::Render, "r-2"));
        assert!(d.forget(ServiceKind::Render, "r-2"));
        assert!(!d.forget(ServiceKind::Render, "r-2"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.seen.lock().await.is_empty());
        assert_eq!(d.pending(), 0);
    }

    #[tokio::test]
    async fn root_cancellation_stops_everything() {
        let polls = Arc::new(ScriptedPolls::default());
        let d = detector(polls, Duration::from_secs(5)).await;
        let sink = Arc::new(RecordingSink::default());
        d.watch(job("a"), sink.clone());
        d.watch(job("b"), sink.clone());

        d.root.cancel();
        wait_for_idle(&d).await;
        assert!(sink.seen.lock().await.is_empty());
    }
}
