//! Pure helpers around the workflow state machine: the idempotency key and
//! the per-stage submission payloads built from a record.

use chrono::NaiveDate;

use crate::error::{PipelineError, Result};
use crate::model::{ContentItem, ServiceKind, WorkflowRecord};
use crate::services::{CaptionRequest, JobPayload, RenderRequest, ScheduleRequest, Script};

pub const VIDEO_WIDTH: u32 = 1080;
pub const VIDEO_HEIGHT: u32 = 1920;

/// `{item}:{YYYY-MM-DD}:{sequence}`. The sequence is the queue entry's
/// dispatch ordinal, so a re-dispatch on the same day gets a fresh key while a
/// repeated create for the same dispatch collides.
pub fn idempotency_key(content_item_id: &str, date: NaiveDate, sequence: i64) -> String {
    format!("{}:{}:{}", content_item_id, date.format("%Y-%m-%d"), sequence)
}

/// Settings shared by every payload a workflow submits.
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub public_base_url: String,
    pub platforms: Vec<String>,
}

impl RequestDefaults {
    pub fn callback_url(&self, service: ServiceKind) -> String {
        format!(
            "{}/webhooks/{}",
            self.public_base_url.trim_end_matches('/'),
            service.as_str()
        )
    }
}

/// Cheap checks on the item itself, before a script is generated.
pub fn check_item(item: &ContentItem, brand: &str) -> Result<()> {
    if !item.eligible {
        return Err(PipelineError::Validation(format!("item {} is not eligible", item.id)));
    }
    if item.brand != brand {
        return Err(PipelineError::Validation(format!(
            "item {} belongs to {}, not {brand}",
            item.id, item.brand
        )));
    }
    if item.label.trim().is_empty() {
        return Err(PipelineError::Validation(format!("item {} has no label", item.id)));
    }
    Ok(())
}

/// First-stage payload. Built and validated before the record exists.
pub fn render_payload(workflow_id: &str, script: &Script, defaults: &RequestDefaults) -> Result<JobPayload> {
    let payload = JobPayload::Render(RenderRequest {
        title: script.title.clone(),
        input_text: script.text.clone(),
        width: VIDEO_WIDTH,
        height: VIDEO_HEIGHT,
        callback_id: workflow_id.to_string(),
        callback_url: defaults.callback_url(ServiceKind::Render),
    });
    payload.validate()?;
    Ok(payload)
}

/// Payload for a later stage, fed by the previous stage's result url. A
/// previous stage that completed without one is that service's failure.
pub fn stage_payload(
    record: &WorkflowRecord,
    service: ServiceKind,
    defaults: &RequestDefaults,
) -> Result<JobPayload> {
    let input = |upstream: ServiceKind| {
        record.input_url(service).map(str::to_string).ok_or_else(|| {
            PipelineError::terminal(upstream, format!("{upstream} completed without a result url"))
        })
    };
    let title = record.script_title.clone().unwrap_or_default();
    let payload = match service {
        ServiceKind::Render => {
            return Err(PipelineError::Validation(
                "render payload is built from the script".into(),
            ))
        }
        ServiceKind::Caption => JobPayload::Caption(CaptionRequest {
            title,
            video_url: input(ServiceKind::Render)?,
            callback_id: record.id.clone(),
            callback_url: defaults.callback_url(service),
        }),
        ServiceKind::Schedule => JobPayload::Schedule(ScheduleRequest {
            video_url: input(ServiceKind::Caption)?,
            caption: record.script_caption.clone().unwrap_or_default(),
            title,
            platforms: defaults.platforms.clone(),
            schedule_time: None,
            callback_id: record.id.clone(),
            callback_url: defaults.callback_url(service),
        }),
    };
    payload.validate()?;
    Ok(payload)
}
