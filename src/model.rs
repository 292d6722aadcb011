use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::ErrorKind;

/// External job services, one per pipeline stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Render,
    Caption,
    Schedule,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Render, ServiceKind::Caption, ServiceKind::Schedule];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Render => "render",
            ServiceKind::Caption => "caption",
            ServiceKind::Schedule => "schedule",
        }
    }

    pub fn parse_service(s: &str) -> Option<Self> {
        match s {
            "render" => Some(ServiceKind::Render),
            "caption" => Some(ServiceKind::Caption),
            "schedule" => Some(ServiceKind::Schedule),
            _ => None,
        }
    }

    /// Operation name written on cost events.
    pub fn operation(&self) -> &'static str {
        match self {
            ServiceKind::Render => "video_generation",
            ServiceKind::Caption => "caption_processing",
            ServiceKind::Schedule => "post_to_social",
        }
    }

    /// Stage a record sits in while this service's job runs.
    pub fn processing_stage(&self) -> WorkflowStage {
        match self {
            ServiceKind::Render => WorkflowStage::RenderProcessing,
            ServiceKind::Caption => WorkflowStage::CaptionProcessing,
            ServiceKind::Schedule => WorkflowStage::ScheduleProcessing,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    /// Completed for the current cycle.
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueStatus::Queued),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Queued,
    RenderProcessing,
    CaptionProcessing,
    ScheduleProcessing,
    Completed,
    Failed,
    Skipped,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Queued => "queued",
            WorkflowStage::RenderProcessing => "render_processing",
            WorkflowStage::CaptionProcessing => "caption_processing",
            WorkflowStage::ScheduleProcessing => "schedule_processing",
            WorkflowStage::Completed => "completed",
            WorkflowStage::Failed => "failed",
            WorkflowStage::Skipped => "skipped",
        }
    }

    pub fn parse_stage(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(WorkflowStage::Queued),
            "render_processing" => Some(WorkflowStage::RenderProcessing),
            "caption_processing" => Some(WorkflowStage::CaptionProcessing),
            "schedule_processing" => Some(WorkflowStage::ScheduleProcessing),
            "completed" => Some(WorkflowStage::Completed),
            "failed" => Some(WorkflowStage::Failed),
            "skipped" => Some(WorkflowStage::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStage::Completed | WorkflowStage::Failed | WorkflowStage::Skipped
        )
    }

    /// Service whose job is in flight while the record sits in this stage.
    pub fn service(&self) -> Option<ServiceKind> {
        match self {
            WorkflowStage::RenderProcessing => Some(ServiceKind::Render),
            WorkflowStage::CaptionProcessing => Some(ServiceKind::Caption),
            WorkflowStage::ScheduleProcessing => Some(ServiceKind::Schedule),
            _ => None,
        }
    }

    /// Where a successful job in this stage moves the record.
    pub fn on_success(&self) -> Option<WorkflowStage> {
        match self {
            WorkflowStage::RenderProcessing => Some(WorkflowStage::CaptionProcessing),
            WorkflowStage::CaptionProcessing => Some(WorkflowStage::ScheduleProcessing),
            WorkflowStage::ScheduleProcessing => Some(WorkflowStage::Completed),
            _ => None,
        }
    }

    pub const ALL: [WorkflowStage; 7] = [
        WorkflowStage::Queued,
        WorkflowStage::RenderProcessing,
        WorkflowStage::CaptionProcessing,
        WorkflowStage::ScheduleProcessing,
        WorkflowStage::Completed,
        WorkflowStage::Failed,
        WorkflowStage::Skipped,
    ];
}

/// An entity from the source catalog that can be turned into a video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
    pub id: String,
    pub label: String,
    pub brand: String,
    #[serde(default = "default_true")]
    pub eligible: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub brand: String,
    pub content_item_id: String,
    pub position: i64,
    pub status: QueueStatus,
    pub skipped: bool,
    pub cycle_count: i64,
    pub dispatch_count: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub idempotency_key: String,
    pub brand: String,
    pub content_item_id: String,
    pub stage: WorkflowStage,
    pub render_job_id: Option<String>,
    pub caption_job_id: Option<String>,
    pub schedule_job_id: Option<String>,
    pub render_url: Option<String>,
    pub caption_url: Option<String>,
    pub post_url: Option<String>,
    pub render_attempts: i64,
    pub caption_attempts: i64,
    pub schedule_attempts: i64,
    pub script_title: Option<String>,
    pub script_caption: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn job_id(&self, service: ServiceKind) -> Option<&str> {
        match service {
            ServiceKind::Render => self.render_job_id.as_deref(),
            ServiceKind::Caption => self.caption_job_id.as_deref(),
            ServiceKind::Schedule => self.schedule_job_id.as_deref(),
        }
    }

    /// Output of the stage before `service`, which is the next stage's input.
    pub fn input_url(&self, service: ServiceKind) -> Option<&str> {
        match service {
            ServiceKind::Render => None,
            ServiceKind::Caption => self.render_url.as_deref(),
            ServiceKind::Schedule => self.caption_url.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostEvent {
    pub service: ServiceKind,
    pub brand: String,
    pub operation: String,
    pub units: f64,
    pub cost_usd: f64,
    pub workflow_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// How an external job ended, whichever path reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { result_url: Option<String> },
    Failed { error: String },
    TimedOut { waited: Duration },
}
