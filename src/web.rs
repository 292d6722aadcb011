//! Inbound HTTP surface: job-service webhooks, `/status` and `/health`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::detector::{OutcomeSink, Resolution};
use crate::engine::Engine;
use crate::model::{JobOutcome, ServiceKind};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Completed,
    Failed,
}

/// Body every job service posts back on completion.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    pub status: WebhookStatus,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn into_outcome(self) -> JobOutcome {
        match self.status {
            WebhookStatus::Completed => JobOutcome::Completed {
                result_url: self.result_url,
            },
            WebhookStatus::Failed => JobOutcome::Failed {
                error: self.error.unwrap_or_else(|| "job reported failure".into()),
            },
        }
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/webhooks/{service}", post(webhook))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(engine)
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

async fn webhook(
    State(engine): State<Arc<Engine>>,
    Path(service): Path<String>,
    Json(payload): Json<WebhookPayload>,
) -> Response {
    let Some(service) = ServiceKind::parse_service(&service) else {
        return json_error(StatusCode::NOT_FOUND, "unknown_service", format!("no service named {service}"));
    };
    if payload.job_id.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "invalid_payload", "job_id must be non-empty");
    }

    let job_id = payload.job_id.clone();
    match engine.resolve(service, &job_id, payload.into_outcome()).await {
        Ok(resolution) => {
            if resolution == Resolution::Unknown {
                warn!(%service, job_id = %job_id, "webhook for unknown job");
            } else {
                info!(%service, job_id = %job_id, ?resolution, "webhook applied");
            }
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Err(err) => {
            warn!(%service, job_id = %job_id, error = %err, "failed to apply webhook");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
        }
    }
}

async fn status(State(engine): State<Arc<Engine>>) -> Response {
    match engine.status().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string()),
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}
