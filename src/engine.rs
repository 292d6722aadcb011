//! Drives content items through render, caption and schedule.
//!
//! The engine is the only place that turns an error kind into a workflow
//! transition:
//!
//! | error                           | render stage                   | caption and schedule            |
//! |---------------------------------|--------------------------------|---------------------------------|
//! | validation                      | record skipped, entry sits out | record skipped, entry sits out  |
//! | stage done without a result url | n/a                            | record failed, entry completed  |
//! | rate limited / breaker / budget | no record, entry released      | record waits, sweep resubmits   |
//! | transient (after retries)       | record failed, entry completed | record failed, entry completed  |
//! | terminal                        | record failed, entry completed | record failed, entry completed  |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::cost::{CostSnapshot, CostTracker};
use crate::db::queue::QueueStats;
use crate::db::workflows::{self, LastError, NewWorkflow};
use crate::db::Pool;
use crate::detector::{CompletionDetector, OutcomeSink, PendingJob, Resolution};
use crate::error::{ErrorKind, PipelineError, Result, TIMEOUT_MARKER};
use crate::model::{JobOutcome, QueueEntry, QueueStatus, ServiceKind, WorkflowRecord, WorkflowStage};
use crate::resilience::{Attempted, CallContext, Guards, ResilienceRegistry, ResilienceSnapshot};
use crate::rotation::{ReconcileReport, RotationQueue};
use crate::services::{
    HttpJobService, JobPayload, JobServices, Script, ScriptProvider, SourceCatalog, TemplateScriptProvider,
    YamlCatalog,
};
use crate::workflow::{self, RequestDefaults};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub brands: Vec<String>,
    pub poll_interval: Duration,
    pub max_stage_wait: Duration,
    pub max_workflow_age: Duration,
    pub enforce_budgets: bool,
    pub defaults: RequestDefaults,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            brands: cfg.app.brands.clone(),
            poll_interval: Duration::from_secs(cfg.pipeline.poll_interval_secs),
            max_stage_wait: Duration::from_secs(cfg.pipeline.max_stage_wait_secs),
            max_workflow_age: Duration::from_secs(cfg.pipeline.max_workflow_age_secs),
            enforce_budgets: cfg.budgets.enforce,
            defaults: RequestDefaults {
                public_base_url: cfg.app.public_base_url.clone(),
                platforms: cfg.pipeline.platforms.clone(),
            },
        }
    }
}

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub pool: Pool,
    pub catalog: Arc<dyn SourceCatalog>,
    pub scripts: Arc<dyn ScriptProvider>,
    pub services: JobServices,
    pub registry: Arc<ResilienceRegistry>,
    pub costs: CostTracker,
    pub shutdown: CancellationToken,
}

impl EngineDeps {
    /// Production wiring: HTTP job services, the YAML catalog and the
    /// template script provider.
    pub fn from_config(cfg: &Config, pool: Pool, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let services = JobServices {
            render: Arc::new(HttpJobService::from_config(ServiceKind::Render, &cfg.services.render)?),
            caption: Arc::new(HttpJobService::from_config(ServiceKind::Caption, &cfg.services.caption)?),
            schedule: Arc::new(HttpJobService::from_config(ServiceKind::Schedule, &cfg.services.schedule)?),
        };
        Ok(Self {
            costs: CostTracker::new(pool.clone(), cfg.budgets.clone()),
            pool,
            catalog: Arc::new(YamlCatalog::new(&cfg.app.catalog_path)),
            scripts: Arc::new(TemplateScriptProvider::new(cfg.script.clone())),
            services,
            registry: Arc::new(ResilienceRegistry::from_config(&cfg.services)),
            shutdown,
        })
    }
}

/// What one tick did for a brand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to hand out.
    Idle,
    Started { workflow_id: String, job_id: String },
    Skipped { content_item_id: String, reason: String },
    Deferred { content_item_id: String, reason: String },
    Failed { workflow_id: String, reason: String },
    Duplicate { idempotency_key: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub resubmitted: u32,
    pub rewatched: u32,
    pub expired: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrandStatus {
    pub brand: String,
    pub queue: QueueStats,
    pub workflows: BTreeMap<String, i64>,
    pub last_error: Option<LastError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub brands: Vec<BrandStatus>,
    pub costs: CostSnapshot,
    pub resilience: ResilienceSnapshot,
    pub pending_polls: usize,
}

/// Result of trying to hand a stage to its service.
#[derive(Debug)]
enum Submission {
    Accepted { job_id: String },
    Deferred(PipelineError),
    Rejected(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageResult {
    Submitted,
    /// Blocked before the transport; the record waits for the sweep.
    Deferred,
    Failed,
    Skipped,
    /// The record is not waiting for this stage any more.
    Stale,
}

pub struct Engine {
    me: Weak<Engine>,
    pool: Pool,
    queue: RotationQueue,
    catalog: Arc<dyn SourceCatalog>,
    scripts: Arc<dyn ScriptProvider>,
    services: JobServices,
    guards: Guards,
    registry: Arc<ResilienceRegistry>,
    costs: CostTracker,
    detector: CompletionDetector,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Arc<Self> {
        let guards = deps.registry.guards(&deps.costs);
        let detector = CompletionDetector::new(
            guards.clone(),
            deps.services.clone(),
            settings.poll_interval,
            settings.max_stage_wait,
            deps.shutdown,
        );
        Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            queue: RotationQueue::new(deps.pool.clone()),
            pool: deps.pool,
            catalog: deps.catalog,
            scripts: deps.scripts,
            services: deps.services,
            guards,
            registry: deps.registry,
            costs: deps.costs,
            detector,
            settings,
        })
    }

    pub fn queue(&self) -> &RotationQueue {
        &self.queue
    }

    pub fn detector(&self) -> &CompletionDetector {
        &self.detector
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn reconcile(&self, brand: &str) -> Result<ReconcileReport> {
        self.queue.reconcile(brand, self.catalog.as_ref()).await
    }

    /// Dequeue at most one item for `brand` and start its workflow.
    #[instrument(skip_all, fields(brand = %brand))]
    pub async fn run_once(&self, brand: &str) -> Result<TickOutcome> {
        let Some(entry) = self.claim(brand).await? else {
            debug!("nothing to dispatch");
            return Ok(TickOutcome::Idle);
        };
        match self.start(brand, &entry).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(item = %entry.content_item_id, error = %err, "dispatch aborted, releasing entry");
                if let Err(release_err) = self.queue.release(brand, &entry.content_item_id).await {
                    warn!(error = %release_err, "failed to release entry");
                }
                Err(err)
            }
        }
    }

    /// Sync the partition with the catalog, then claim. An unreachable
    /// catalog does not stop the rotation; the queue as it stands is used.
    async fn claim(&self, brand: &str) -> Result<Option<QueueEntry>> {
        if let Err(err) = self.reconcile(brand).await {
            warn!(error = %err, "reconcile failed, dispatching from the current queue");
        }
        if let Some(entry) = self.queue.next(brand).await? {
            return Ok(Some(entry));
        }
        if self.queue.reset_cycle(brand).await? == 0 {
            return Ok(None);
        }
        self.queue.next(brand).await
    }

    async fn start(&self, brand: &str, entry: &QueueEntry) -> Result<TickOutcome> {
        let item_id = entry.content_item_id.as_str();
        let key = workflow::idempotency_key(item_id, Utc::now().date_naive(), entry.dispatch_count);
        let workflow_id = workflows::new_id();

        let (script, payload) = match self.prepare(brand, item_id, &workflow_id).await {
            Ok(prepared) => prepared,
            Err(err @ PipelineError::Validation(_)) => {
                return self.skip(brand, item_id, &key, &workflow_id, &err).await
            }
            Err(err) => return Err(err),
        };

        let admitted = match self.check_budget(ServiceKind::Render).await? {
            Ok(()) => self.guards.get(ServiceKind::Render).ready(),
            Err(err) => Err(err),
        };
        if let Err(err) = admitted {
            info!(item = item_id, reason = %err, "render deferred");
            self.queue.release(brand, item_id).await?;
            return Ok(TickOutcome::Deferred {
                content_item_id: item_id.to_string(),
                reason: err.to_string(),
            });
        }

        let record = match workflows::insert(
            &self.pool,
            NewWorkflow {
                id: &workflow_id,
                idempotency_key: &key,
                brand,
                content_item_id: item_id,
                stage: WorkflowStage::Queued,
                script_title: Some(&script.title),
                script_caption: Some(&script.caption),
                error: None,
            },
        )
        .await
        {
            Ok(record) => record,
            Err(PipelineError::DuplicateWorkflow { key }) => return self.on_duplicate(brand, item_id, key).await,
            Err(err) => return Err(err),
        };
        info!(workflow_id = %record.id, key = %key, "workflow opened");

        match self.submit(&record, &payload).await {
            Submission::Accepted { job_id } => Ok(TickOutcome::Started {
                workflow_id: record.id,
                job_id,
            }),
            Submission::Deferred(err) => {
                let detail = format!("render deferred, entry released: {err}");
                workflows::finish_with_error(
                    &self.pool,
                    &record.id,
                    WorkflowStage::Queued,
                    WorkflowStage::Failed,
                    err.kind(),
                    &detail,
                )
                .await?;
                self.queue.release(brand, item_id).await?;
                Ok(TickOutcome::Deferred {
                    content_item_id: item_id.to_string(),
                    reason: err.to_string(),
                })
            }
            Submission::Rejected(err) => {
                self.fail(&record, WorkflowStage::Queued, err.kind(), &err.to_string())
                    .await?;
                Ok(TickOutcome::Failed {
                    workflow_id: record.id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Load the item, generate its script and build the render payload.
    async fn prepare(&self, brand: &str, item_id: &str, workflow_id: &str) -> Result<(Script, JobPayload)> {
        let item = self
            .catalog
            .get_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::Validation(format!("item {item_id} is no longer in the catalog")))?;
        workflow::check_item(&item, brand)?;
        let script = self.scripts.generate_script(&item).await?;
        let payload = workflow::render_payload(workflow_id, &script, &self.settings.defaults)?;
        Ok((script, payload))
    }

    async fn skip(
        &self,
        brand: &str,
        item_id: &str,
        key: &str,
        workflow_id: &str,
        err: &PipelineError,
    ) -> Result<TickOutcome> {
        let detail = err.to_string();
        warn!(item = item_id, reason = %detail, "item failed validation, skipping for this cycle");
        match workflows::insert(
            &self.pool,
            NewWorkflow {
                id: workflow_id,
                idempotency_key: key,
                brand,
                content_item_id: item_id,
                stage: WorkflowStage::Skipped,
                script_title: None,
                script_caption: None,
                error: Some((ErrorKind::Validation, &detail)),
            },
        )
        .await
        {
            Ok(_) | Err(PipelineError::DuplicateWorkflow { .. }) => {}
            Err(e) => return Err(e),
        }
        self.queue.reset_to_queued(brand, item_id).await?;
        Ok(TickOutcome::Skipped {
            content_item_id: item_id.to_string(),
            reason: detail,
        })
    }

    /// Another record already holds this key. If it is finished the entry is
    /// done too; otherwise that record will complete the entry itself.
    async fn on_duplicate(&self, brand: &str, item_id: &str, key: String) -> Result<TickOutcome> {
        warn!(key = %key, "duplicate workflow blocked");
        if let Some(existing) = workflows::get_by_key(&self.pool, &key).await? {
            if existing.is_terminal() {
                self.queue.complete(brand, item_id).await?;
            }
        }
        Ok(TickOutcome::Duplicate { idempotency_key: key })
    }

    /// `Ok(Err(_))` when budgets are enforced and the next call would not fit.
    async fn check_budget(&self, service: ServiceKind) -> Result<std::result::Result<(), PipelineError>> {
        if !self.settings.enforce_budgets {
            return Ok(Ok(()));
        }
        let units = self.guards.get(service).pricing().units_per_call;
        let verdict = self.costs.can_afford(service, units).await?;
        if verdict.allowed {
            Ok(Ok(()))
        } else {
            Ok(Err(PipelineError::BudgetExceeded {
                service,
                reason: verdict.reason.unwrap_or_default(),
            }))
        }
    }

    /// Submit `payload` for `record` through the service guard. On acceptance
    /// the job id is stored and the detector starts watching it; otherwise the
    /// attempts spent are added to the record.
    async fn submit(&self, record: &WorkflowRecord, payload: &JobPayload) -> Submission {
        let service = payload.service();
        let attempted = self.call(record, payload).await;
        let attempts = attempted.attempts;
        match attempted.result {
            Ok(job_id) => {
                let expected = record.stage;
                match workflows::mark_submitted(&self.pool, &record.id, expected, service, &job_id, attempts).await {
                    Ok(true) => {
                        info!(workflow_id = %record.id, %service, job_id = %job_id, attempts, "stage submitted");
                        self.watch(&record.id, service, &job_id, Utc::now());
                    }
                    Ok(false) => {
                        warn!(workflow_id = %record.id, %service, job_id = %job_id, "record moved during submission")
                    }
                    Err(err) => return Submission::Rejected(err),
                }
                Submission::Accepted { job_id }
            }
            Err(err) => {
                if attempts > 0 {
                    if let Err(e) = workflows::add_attempts(&self.pool, &record.id, service, attempts).await {
                        warn!(error = %e, "failed to record attempts");
                    }
                }
                if err.is_deferrable() {
                    Submission::Deferred(err)
                } else {
                    Submission::Rejected(err)
                }
            }
        }
    }

    async fn call(&self, record: &WorkflowRecord, payload: &JobPayload) -> Attempted<String> {
        let service = payload.service();
        let client = self.services.get(service);
        let ctx = CallContext {
            brand: &record.brand,
            workflow_id: Some(&record.id),
        };
        self.guards
            .get(service)
            .call(ctx, || client.submit(payload))
            .await
    }

    fn watch(&self, workflow_id: &str, service: ServiceKind, job_id: &str, submitted_at: DateTime<Utc>) {
        let Some(sink) = self.me.upgrade() else {
            return;
        };
        self.detector.watch(
            PendingJob {
                workflow_id: workflow_id.to_string(),
                service,
                job_id: job_id.to_string(),
                submitted_at,
            },
            sink,
        );
    }

    /// Move a record to `failed` and count its entry as done for the cycle.
    async fn fail(
        &self,
        record: &WorkflowRecord,
        expected: WorkflowStage,
        kind: ErrorKind,
        detail: &str,
    ) -> Result<Resolution> {
        let moved = workflows::finish_with_error(
            &self.pool,
            &record.id,
            expected,
            WorkflowStage::Failed,
            kind,
            detail,
        )
        .await?;
        if !moved {
            return Ok(Resolution::AlreadyResolved);
        }
        warn!(workflow_id = %record.id, stage = expected.as_str(), kind = kind.as_str(), detail, "workflow failed");
        self.queue.complete(&record.brand, &record.content_item_id).await?;
        Ok(Resolution::Failed)
    }

    /// Submit the job for a later stage if the record is waiting in that
    /// stage without one.
    async fn submit_stage(&self, workflow_id: &str, service: ServiceKind) -> Result<StageResult> {
        let record = workflows::get(&self.pool, workflow_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("workflow {workflow_id}")))?;
        let stage = service.processing_stage();
        if record.stage != stage || record.job_id(service).is_some() {
            return Ok(StageResult::Stale);
        }

        let payload = match workflow::stage_payload(&record, service, &self.settings.defaults) {
            Ok(payload) => payload,
            Err(err @ PipelineError::Validation(_)) => {
                let moved = workflows::finish_with_error(
                    &self.pool,
                    &record.id,
                    stage,
                    WorkflowStage::Skipped,
                    err.kind(),
                    &err.to_string(),
                )
                .await?;
                if !moved {
                    return Ok(StageResult::Stale);
                }
                warn!(workflow_id, %service, reason = %err, "stage payload failed validation, skipping for this cycle");
                self.queue.reset_to_queued(&record.brand, &record.content_item_id).await?;
                return Ok(StageResult::Skipped);
            }
            Err(err) => {
                self.fail(&record, stage, err.kind(), &err.to_string()).await?;
                return Ok(StageResult::Failed);
            }
        };
        let submission = match self.check_budget(service).await? {
            Ok(()) => self.submit(&record, &payload).await,
            Err(err) => Submission::Deferred(err),
        };
        match submission {
            Submission::Accepted { .. } => Ok(StageResult::Submitted),
            Submission::Deferred(err) => {
                info!(workflow_id, %service, reason = %err, "stage deferred, sweep will resubmit");
                workflows::note_deferral(&self.pool, workflow_id, stage, service, err.kind(), &err.to_string())
                    .await?;
                Ok(StageResult::Deferred)
            }
            Submission::Rejected(err) => {
                self.fail(&record, stage, err.kind(), &err.to_string()).await?;
                Ok(StageResult::Failed)
            }
        }
    }

    /// Recover work that fell through the cracks: resubmit deferred stages,
    /// re-watch jobs nobody is polling (e.g. after a restart) and fail
    /// records that have been open too long.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();
        let elapsed = |since: DateTime<Utc>| (now - since).to_std().unwrap_or_default();

        for record in workflows::list_open(&self.pool).await? {
            if elapsed(record.created_at) > self.settings.max_workflow_age {
                if let Some(service) = record.stage.service() {
                    if let Some(job_id) = record.job_id(service) {
                        self.detector.forget(service, job_id);
                    }
                }
                let detail = format!(
                    "{TIMEOUT_MARKER}: workflow open longer than {}s",
                    self.settings.max_workflow_age.as_secs()
                );
                if self.fail(&record, record.stage, ErrorKind::TerminalService, &detail).await? == Resolution::Failed {
                    report.expired += 1;
                }
                continue;
            }

            let Some(service) = record.stage.service() else {
                // Opened but never submitted; the process died in between.
                if elapsed(record.updated_at) > self.settings.max_stage_wait {
                    let detail = "abandoned before render submission";
                    if self.fail(&record, record.stage, ErrorKind::TerminalService, detail).await? == Resolution::Failed {
                        report.expired += 1;
                    }
                }
                continue;
            };
            match record.job_id(service) {
                None => {
                    if self.submit_stage(&record.id, service).await? == StageResult::Submitted {
                        report.resubmitted += 1;
                    }
                }
                Some(job_id) if !self.detector.is_watching(service, job_id) => {
                    self.watch(&record.id, service, job_id, record.updated_at);
                    report.rewatched += 1;
                }
                Some(_) => {}
            }
        }
        if report != SweepReport::default() {
            info!(?report, "sweep finished");
        }
        Ok(report)
    }

    /// Give back entries left `processing` with no open workflow, which
    /// happens when the process stops between claiming an entry and opening
    /// its record. Only safe before the tick loops start.
    #[instrument(skip_all)]
    pub async fn recover_orphans(&self) -> Result<u64> {
        let open: HashSet<(String, String)> = workflows::list_open(&self.pool)
            .await?
            .into_iter()
            .map(|r| (r.brand, r.content_item_id))
            .collect();
        let mut released = 0;
        for brand in &self.settings.brands {
            for entry in self.queue.entries(brand).await? {
                if entry.status != QueueStatus::Processing
                    || open.contains(&(brand.clone(), entry.content_item_id.clone()))
                {
                    continue;
                }
                if self.queue.release(brand, &entry.content_item_id).await? {
                    warn!(brand = %brand, item = %entry.content_item_id, "released orphaned entry");
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let mut brands = Vec::with_capacity(self.settings.brands.len());
        for brand in &self.settings.brands {
            brands.push(BrandStatus {
                brand: brand.clone(),
                queue: self.queue.stats(brand).await?,
                workflows: workflows::count_by_stage(&self.pool, brand).await?,
                last_error: workflows::last_error(&self.pool, brand).await?,
            });
        }
        Ok(StatusReport {
            generated_at: Utc::now(),
            brands,
            costs: self.costs.snapshot().await?,
            resilience: self.registry.snapshot(),
            pending_polls: self.detector.pending(),
        })
    }
}

#[async_trait]
impl OutcomeSink for Engine {
    #[instrument(skip_all, fields(%service, job_id = %job_id))]
    async fn resolve(&self, service: ServiceKind, job_id: &str, outcome: JobOutcome) -> Result<Resolution> {
        let Some((record, owner)) = workflows::find_by_job_id(&self.pool, job_id).await? else {
            warn!("outcome for unknown job ignored");
            return Ok(Resolution::Unknown);
        };
        if owner != service {
            warn!(owner = %owner, "job id belongs to another service, ignored");
            return Ok(Resolution::Unknown);
        }
        self.detector.forget(service, job_id);

        let stage = service.processing_stage();
        if record.stage != stage {
            debug!(stage = record.stage.as_str(), "already resolved");
            return Ok(Resolution::AlreadyResolved);
        }

        match outcome {
            JobOutcome::Completed { result_url } => {
                let Some(next) = stage.on_success() else {
                    return Ok(Resolution::AlreadyResolved);
                };
                if !workflows::advance(&self.pool, &record.id, stage, next, result_url.as_deref()).await? {
                    return Ok(Resolution::AlreadyResolved);
                }
                info!(workflow_id = %record.id, next = next.as_str(), "stage completed");
                match next.service() {
                    Some(next_service) => Ok(match self.submit_stage(&record.id, next_service).await? {
                        StageResult::Failed => Resolution::Failed,
                        StageResult::Skipped => Resolution::Skipped,
                        _ => Resolution::Advanced(next),
                    }),
                    None => {
                        self.queue.complete(&record.brand, &record.content_item_id).await?;
                        info!(workflow_id = %record.id, "workflow completed");
                        Ok(Resolution::Completed)
                    }
                }
            }
            JobOutcome::Failed { error } => {
                let detail = format!("{service} job {job_id} failed: {error}");
                self.fail(&record, stage, ErrorKind::TerminalService, &detail).await
            }
            JobOutcome::TimedOut { waited } => {
                let err = PipelineError::timed_out(service, waited);
                self.fail(&record, stage, err.kind(), &err.to_string()).await
            }
        }
    }
}
