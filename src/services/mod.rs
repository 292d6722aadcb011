//! Seams to everything outside the engine: the three stage job services, the
//! source catalog and the script provider.

pub mod catalog;
pub mod http;
pub mod payload;
pub mod script;

pub use catalog::YamlCatalog;
pub use http::HttpJobService;
pub use payload::{CaptionRequest, JobPayload, RenderRequest, ScheduleRequest};
pub use script::TemplateScriptProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::model::{ContentItem, JobOutcome, ServiceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            status: JobState::Pending,
            result_url: None,
            error: None,
        }
    }

    /// `None` while the job is still running.
    pub fn into_outcome(self) -> Option<JobOutcome> {
        match self.status {
            JobState::Pending => None,
            JobState::Completed => Some(JobOutcome::Completed {
                result_url: self.result_url,
            }),
            JobState::Failed => Some(JobOutcome::Failed {
                error: self.error.unwrap_or_else(|| "job failed".into()),
            }),
        }
    }
}

/// One external asynchronous job service.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submit a job; returns the external job id.
    async fn submit(&self, payload: &JobPayload) -> Result<String>;

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus>;
}

#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Eligible items for a brand, in catalog order.
    async fn list_eligible_items(&self, brand: &str) -> Result<Vec<ContentItem>>;

    async fn get_item(&self, id: &str) -> Result<Option<ContentItem>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub text: String,
    pub title: String,
    pub caption: String,
}

#[async_trait]
pub trait ScriptProvider: Send + Sync {
    async fn generate_script(&self, item: &ContentItem) -> Result<Script>;
}

/// The three job services, addressed by stage.
#[derive(Clone)]
pub struct JobServices {
    pub render: Arc<dyn JobService>,
    pub caption: Arc<dyn JobService>,
    pub schedule: Arc<dyn JobService>,
}

impl JobServices {
    pub fn get(&self, kind: ServiceKind) -> &Arc<dyn JobService> {
        match kind {
            ServiceKind::Render => &self.render,
            ServiceKind::Caption => &self.caption,
            ServiceKind::Schedule => &self.schedule,
        }
    }
}
