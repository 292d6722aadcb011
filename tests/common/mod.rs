#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use reelcycle::config::{self, Config};
use reelcycle::cost::CostTracker;
use reelcycle::db::{self, Pool};
use reelcycle::detector::{OutcomeSink, Resolution};
use reelcycle::engine::{Engine, EngineDeps, EngineSettings};
use reelcycle::error::{PipelineError, Result};
use reelcycle::model::{ContentItem, JobOutcome, ServiceKind, WorkflowRecord};
use reelcycle::resilience::ResilienceRegistry;
use reelcycle::services::{
    JobPayload, JobService, JobServices, JobState, JobStatus, SourceCatalog, TemplateScriptProvider,
};

pub const BRAND: &str = "ownerfi";

pub async fn setup_pool() -> Pool {
    db::memory_pool().await.unwrap()
}

pub fn item(id: &str, city: Option<&str>) -> ContentItem {
    let mut attributes = BTreeMap::new();
    if let Some(c) = city {
        attributes.insert("city".to_string(), c.to_string());
    }
    ContentItem {
        id: id.into(),
        label: format!("{id} Main St"),
        brand: BRAND.into(),
        eligible: true,
        attributes,
    }
}

#[derive(Default)]
pub struct StaticCatalog {
    items: std::sync::Mutex<Vec<ContentItem>>,
}

impl StaticCatalog {
    pub fn new(items: Vec<ContentItem>) -> Self {
        Self {
            items: std::sync::Mutex::new(items),
        }
    }

    pub fn set(&self, items: Vec<ContentItem>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn list_eligible_items(&self, brand: &str) -> Result<Vec<ContentItem>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.brand == brand && i.eligible)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        Ok(self.items.lock().unwrap().iter().find(|i| i.id == id).cloned())
    }
}

/// Job service double. Submissions and polls are answered from queues;
/// once a queue runs dry submissions succeed with `{prefix}-{n}` and polls
/// report pending.
#[derive(Clone)]
pub struct RecordingJobService {
    prefix: &'static str,
    submit_responses: Arc<Mutex<VecDeque<Result<String>>>>,
    poll_responses: Arc<Mutex<VecDeque<Result<JobStatus>>>>,
    submitted: Arc<Mutex<Vec<JobPayload>>>,
    submit_calls: Arc<AtomicUsize>,
    poll_calls: Arc<AtomicUsize>,
}

impl RecordingJobService {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            submit_responses: Arc::default(),
            poll_responses: Arc::default(),
            submitted: Arc::default(),
            submit_calls: Arc::default(),
            poll_calls: Arc::default(),
        }
    }

    pub async fn push_submit(&self, response: Result<String>) {
        self.submit_responses.lock().await.push_back(response);
    }

    pub async fn push_poll(&self, response: Result<JobStatus>) {
        self.poll_responses.lock().await.push_back(response);
    }

    pub async fn submitted(&self) -> Vec<JobPayload> {
        self.submitted.lock().await.clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobService for RecordingJobService {
    async fn submit(&self, payload: &JobPayload) -> Result<String> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted.lock().await.push(payload.clone());
        let mut guard = self.submit_responses.lock().await;
        guard
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{}-{}", self.prefix, n)))
    }

    async fn poll_status(&self, _job_id: &str) -> Result<JobStatus> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.poll_responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(JobStatus::pending()))
    }
}

pub fn completed(url: &str) -> JobStatus {
    JobStatus {
        status: JobState::Completed,
        result_url: Some(url.into()),
        error: None,
    }
}

pub fn transient(service: ServiceKind) -> Result<String> {
    Err(PipelineError::transient(service, "502 bad gateway"))
}

/// Example config with fast retries and limits loose enough for polling at
/// test speed.
pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    for svc in [
        &mut cfg.services.render,
        &mut cfg.services.caption,
        &mut cfg.services.schedule,
    ] {
        svc.retry.base_delay_ms = 1;
        svc.retry.max_delay_ms = 5;
        svc.rate_limit.max_calls = 10_000;
        svc.timeout_secs = 5;
    }
    cfg
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub pool: Pool,
    pub catalog: Arc<StaticCatalog>,
    pub render: RecordingJobService,
    pub caption: RecordingJobService,
    pub schedule: RecordingJobService,
    pub registry: Arc<ResilienceRegistry>,
    pub costs: CostTracker,
    pub shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn harness(items: Vec<ContentItem>) -> Harness {
    harness_with(items, |_| {}, |_| {}).await
}

pub async fn harness_with(
    items: Vec<ContentItem>,
    tweak_config: impl FnOnce(&mut Config),
    tweak_settings: impl FnOnce(&mut EngineSettings),
) -> Harness {
    let mut cfg = test_config();
    tweak_config(&mut cfg);
    let mut settings = EngineSettings::from_config(&cfg);
    settings.poll_interval = Duration::from_millis(20);
    settings.max_stage_wait = Duration::from_secs(30);
    settings.max_workflow_age = Duration::from_secs(3600);
    tweak_settings(&mut settings);

    let pool = setup_pool().await;
    let render = RecordingJobService::new("render");
    let caption = RecordingJobService::new("caption");
    let schedule = RecordingJobService::new("schedule");
    let registry = Arc::new(ResilienceRegistry::from_config(&cfg.services));
    let costs = CostTracker::new(pool.clone(), cfg.budgets.clone());
    let shutdown = CancellationToken::new();
    let catalog = Arc::new(StaticCatalog::new(items));

    let engine = Engine::new(
        EngineDeps {
            pool: pool.clone(),
            catalog: catalog.clone(),
            scripts: Arc::new(TemplateScriptProvider::new(cfg.script.clone())),
            services: JobServices {
                render: Arc::new(render.clone()),
                caption: Arc::new(caption.clone()),
                schedule: Arc::new(schedule.clone()),
            },
            registry: registry.clone(),
            costs: costs.clone(),
            shutdown: shutdown.clone(),
        },
        settings,
    );
    Harness {
        engine,
        pool,
        catalog,
        render,
        caption,
        schedule,
        registry,
        costs,
        shutdown,
    }
}

impl Harness {
    pub async fn record(&self, id: &str) -> WorkflowRecord {
        db::workflows::get(&self.pool, id).await.unwrap().unwrap()
    }

    /// Report success for whatever stage the record is in, the way a webhook would.
    pub async fn complete_stage(&self, id: &str) -> Resolution {
        let rec = self.record(id).await;
        let service = rec.stage.service().expect("record is in a processing stage");
        let job_id = rec.job_id(service).expect("stage has a job id").to_string();
        self.engine
            .resolve(
                service,
                &job_id,
                JobOutcome::Completed {
                    result_url: Some(format!("https://cdn.example.com/{job_id}.mp4")),
                },
            )
            .await
            .unwrap()
    }

    pub async fn wait_for<F>(&self, id: &str, mut done: F) -> WorkflowRecord
    where
        F: FnMut(&WorkflowRecord) -> bool,
    {
        for _ in 0..300 {
            let rec = self.record(id).await;
            if done(&rec) {
                return rec;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {id} never reached the expected state: {:?}", self.record(id).await);
    }

    pub async fn cost_event_count(&self, service: ServiceKind) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM cost_events WHERE service = ?")
            .bind(service.as_str())
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}
