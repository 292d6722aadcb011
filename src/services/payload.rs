//! Typed submission payloads, one struct per stage service.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::ServiceKind;

/// Longest script the render service accepts.
pub const MAX_SCRIPT_CHARS: usize = 5000;
/// Longest caption accepted by every supported platform.
pub const MAX_CAPTION_CHARS: usize = 2200;
pub const SUPPORTED_PLATFORMS: &[&str] = &[
    "instagram",
    "tiktok",
    "youtube",
    "facebook",
    "linkedin",
    "threads",
    "twitter",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderRequest {
    pub title: String,
    pub input_text: String,
    pub width: u32,
    pub height: u32,
    /// Workflow id, echoed back by the service on its callback.
    pub callback_id: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptionRequest {
    pub title: String,
    pub video_url: String,
    pub callback_id: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRequest {
    pub video_url: String,
    pub caption: String,
    pub title: String,
    pub platforms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<DateTime<Utc>>,
    pub callback_id: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Render(RenderRequest),
    Caption(CaptionRequest),
    Schedule(ScheduleRequest),
}

impl JobPayload {
    pub fn service(&self) -> ServiceKind {
        match self {
            JobPayload::Render(_) => ServiceKind::Render,
            JobPayload::Caption(_) => ServiceKind::Caption,
            JobPayload::Schedule(_) => ServiceKind::Schedule,
        }
    }

    /// Reject payloads the service would refuse, before anything is spent on them.
    pub fn validate(&self) -> Result<()> {
        match self {
            JobPayload::Render(r) => {
                non_empty("title", &r.title)?;
                non_empty("input_text", &r.input_text)?;
                if r.input_text.chars().count() > MAX_SCRIPT_CHARS {
                    return Err(PipelineError::Validation(format!(
                        "input_text exceeds {MAX_SCRIPT_CHARS} characters"
                    )));
                }
                if r.width == 0 || r.height == 0 {
                    return Err(PipelineError::Validation("dimensions must be > 0".into()));
                }
                absolute_url("callback_url", &r.callback_url)
            }
            JobPayload::Caption(c) => {
                non_empty("title", &c.title)?;
                absolute_url("video_url", &c.video_url)?;
                absolute_url("callback_url", &c.callback_url)
            }
            JobPayload::Schedule(s) => {
                absolute_url("video_url", &s.video_url)?;
                non_empty("caption", &s.caption)?;
                if s.caption.chars().count() > MAX_CAPTION_CHARS {
                    return Err(PipelineError::Validation(format!(
                        "caption exceeds {MAX_CAPTION_CHARS} characters"
                    )));
                }
                if s.platforms.is_empty() {
                    return Err(PipelineError::Validation("no platforms selected".into()));
                }
                if let Some(p) = s
                    .platforms
                    .iter()
                    .find(|p| !SUPPORTED_PLATFORMS.contains(&p.as_str()))
                {
                    return Err(PipelineError::Validation(format!("unsupported platform {p}")));
                }
                absolute_url("callback_url", &s.callback_url)
            }
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!("{field} must be non-empty")));
    }
    Ok(())
}

fn absolute_url(field: &str, value: &str) -> Result<()> {
    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(PipelineError::Validation(format!(
            "{field} must be an http(s) URL, got '{value}'"
        ))),
    }
}
