//! Error taxonomy shared by the resilience layer, the stores and the engine.
//!
//! The resilience layer only classifies; the engine is the one place that turns
//! an [`ErrorKind`] into a workflow transition.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::ServiceKind;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Marker prefixed to terminal errors produced by the polling timeout.
pub const TIMEOUT_MARKER: &str = "timeout";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{service} transient failure: {message}")]
    TransientService { service: ServiceKind, message: String },

    #[error("{service} terminal failure: {message}")]
    TerminalService { service: ServiceKind, message: String },

    #[error("{service} rate limited; retry in {}s", retry_after.as_secs())]
    RateLimited {
        service: ServiceKind,
        retry_after: Duration,
    },

    #[error("circuit breaker open for {service}")]
    CircuitOpen { service: ServiceKind },

    #[error("{service} budget exhausted: {reason}")]
    BudgetExceeded { service: ServiceKind, reason: String },

    #[error("duplicate workflow blocked: {key}")]
    DuplicateWorkflow { key: String },

    #[error("{0} not found")]
    NotFound(String),

    /// Catalog or script provider could not produce what was asked of it.
    #[error("source unavailable: {0}")]
    Source(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientService,
    TerminalService,
    RateLimited,
    CircuitOpen,
    BudgetExceeded,
    DuplicateWorkflow,
    NotFound,
    Source,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientService => "transient_service",
            ErrorKind::TerminalService => "terminal_service",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::DuplicateWorkflow => "duplicate_workflow",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Source => "source",
            ErrorKind::Storage => "storage",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "transient_service" => Some(ErrorKind::TransientService),
            "terminal_service" => Some(ErrorKind::TerminalService),
            "rate_limited" => Some(ErrorKind::RateLimited),
            "circuit_open" => Some(ErrorKind::CircuitOpen),
            "budget_exceeded" => Some(ErrorKind::BudgetExceeded),
            "duplicate_workflow" => Some(ErrorKind::DuplicateWorkflow),
            "not_found" => Some(ErrorKind::NotFound),
            "source" => Some(ErrorKind::Source),
            "storage" => Some(ErrorKind::Storage),
            _ => None,
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::TransientService { .. } => ErrorKind::TransientService,
            PipelineError::TerminalService { .. } => ErrorKind::TerminalService,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PipelineError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            PipelineError::DuplicateWorkflow { .. } => ErrorKind::DuplicateWorkflow,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Source(_) => ErrorKind::Source,
            PipelineError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only transient service failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientService { .. })
    }

    /// Blocked before reaching the transport; the stage can be tried again later.
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited { .. }
                | PipelineError::CircuitOpen { .. }
                | PipelineError::BudgetExceeded { .. }
        )
    }

    pub fn transient(service: ServiceKind, message: impl Into<String>) -> Self {
        PipelineError::TransientService {
            service,
            message: message.into(),
        }
    }

    pub fn terminal(service: ServiceKind, message: impl Into<String>) -> Self {
        PipelineError::TerminalService {
            service,
            message: message.into(),
        }
    }

    /// Terminal error carrying the timeout marker, used when a job never resolves.
    pub fn timed_out(service: ServiceKind, waited: Duration) -> Self {
        PipelineError::TerminalService {
            service,
            message: format!(
                "{TIMEOUT_MARKER}: no completion after {}s",
                waited.as_secs()
            ),
        }
    }
}
