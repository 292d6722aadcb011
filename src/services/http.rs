use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use super::{JobPayload, JobService, JobStatus};
use crate::config::ServiceConfig;
use crate::error::{PipelineError, Result};
use crate::model::ServiceKind;

/// Bearer-token JSON client for one stage service.
#[derive(Clone)]
pub struct HttpJobService {
    kind: ServiceKind,
    http: Client,
    base_url: Url,
    api_key: String,
    submit_path: String,
    status_path: String,
}

impl fmt::Debug for HttpJobService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpJobService")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id", alias = "video_id", alias = "project_id", alias = "post_id")]
    job_id: String,
}

impl HttpJobService {
    pub fn from_config(kind: ServiceKind, cfg: &ServiceConfig) -> anyhow::Result<Self> {
        let mut base = cfg.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid {kind} base_url"))?;
        let http = Client::builder()
            .user_agent(concat!("reelcycle/", env!("CARGO_PKG_VERSION")))
            // Kept above the guard's per-call timeout so the guard decides.
            .timeout(cfg.timeout() + Duration::from_secs(5))
            .build()
            .context("reqwest client")?;
        Ok(Self {
            kind,
            http,
            base_url,
            api_key: cfg.api_key.clone(),
            submit_path: cfg.submit_path.trim_start_matches('/').to_string(),
            status_path: cfg.status_path.trim_start_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| PipelineError::terminal(self.kind, format!("bad endpoint {path}: {e}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> PipelineError {
        if err.is_decode() {
            PipelineError::terminal(self.kind, format!("undecodable response: {err}"))
        } else {
            PipelineError::transient(self.kind, format!("request failed: {err}"))
        }
    }

    /// 429 and 5xx are worth retrying; any other non-success answer is final.
    async fn check_status(&self, res: reqwest::Response) -> Result<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        warn!(service = %self.kind, %status, body = %body, "job service error");
        let message = format!("{status}: {body}");
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(PipelineError::transient(self.kind, message))
        } else {
            Err(PipelineError::terminal(self.kind, message))
        }
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn submit(&self, payload: &JobPayload) -> Result<String> {
        let url = self.endpoint(&self.submit_path)?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let res = self.check_status(res).await?;
        let body: SubmitResponse = res.json().await.map_err(|e| self.transport_error(e))?;
        info!(service = %self.kind, job_id = %body.job_id, "job submitted");
        Ok(body.job_id)
    }

    async fn poll_status(&self, job_id: &str) -> Result<JobStatus> {
        let url = self.endpoint(&self.status_path.replace("{job_id}", job_id))?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let res = self.check_status(res).await?;
        res.json().await.map_err(|e| self.transport_error(e))
    }
}
