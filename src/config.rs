//! Configuration loader and validator for the content pipeline.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::ServiceKind;

static BRAND_SLUG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,31}$").expect("valid brand slug regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid brand name '{0}': expected a lowercase slug")]
    InvalidBrand(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub pipeline: Pipeline,
    #[serde(default)]
    pub script: ScriptTemplates,
    pub services: Services,
    pub budgets: Budgets,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub listen_addr: String,
    /// Base URL the job services call back on; webhooks live under `/webhooks/{service}`.
    pub public_base_url: String,
    pub tick_interval_secs: u64,
    pub brands: Vec<String>,
    pub catalog_path: String,
}

/// Stage timing for the completion detector and the stale-workflow sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub poll_interval_secs: u64,
    pub max_stage_wait_secs: u64,
    pub max_workflow_age_secs: u64,
    pub sweep_interval_secs: u64,
    pub platforms: Vec<String>,
}

/// Templates for the built-in script provider. `{label}` and `{<attribute>}`
/// placeholders are replaced from the content item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptTemplates {
    pub text: String,
    pub title: String,
    pub caption: String,
}

impl Default for ScriptTemplates {
    fn default() -> Self {
        Self {
            text: "Check out {label}.".into(),
            title: "{label}".into(),
            caption: "{label} #realestate".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Services {
    pub render: ServiceConfig,
    pub caption: ServiceConfig,
    pub schedule: ServiceConfig,
}

impl Services {
    pub fn get(&self, kind: ServiceKind) -> &ServiceConfig {
        match kind {
            ServiceKind::Render => &self.render,
            ServiceKind::Caption => &self.caption,
            ServiceKind::Schedule => &self.schedule,
        }
    }
}

/// One external job service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: String,
    pub submit_path: String,
    /// Status path; `{job_id}` is replaced with the external job id.
    pub status_path: String,
    pub timeout_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub cost: CostConfig,
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostConfig {
    pub units_per_call: f64,
    pub cost_per_unit_usd: f64,
    #[serde(default)]
    pub bill_failed_attempts: bool,
}

/// Budget thresholds in units per period. Services without an entry are unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Budgets {
    pub warning_percent: f64,
    pub critical_percent: f64,
    #[serde(default)]
    pub enforce: bool,
    #[serde(default)]
    pub daily_units: BTreeMap<ServiceKind, f64>,
    #[serde(default)]
    pub monthly_units: BTreeMap<ServiceKind, f64>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/reelcycle.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.listen_addr.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.listen_addr must be host:port"));
    }
    if Url::parse(&cfg.app.public_base_url).is_err() {
        return Err(ConfigError::Invalid("app.public_base_url must be an absolute URL"));
    }
    if cfg.app.tick_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_secs must be > 0"));
    }
    if cfg.app.brands.is_empty() {
        return Err(ConfigError::Invalid("app.brands must list at least one brand"));
    }
    for brand in &cfg.app.brands {
        if !BRAND_SLUG.is_match(brand) {
            return Err(ConfigError::InvalidBrand(brand.clone()));
        }
    }
    if cfg.app.catalog_path.trim().is_empty() {
        return Err(ConfigError::Invalid("app.catalog_path must be non-empty"));
    }

    let p = &cfg.pipeline;
    if p.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid("pipeline.poll_interval_secs must be > 0"));
    }
    if p.max_stage_wait_secs < p.poll_interval_secs {
        return Err(ConfigError::Invalid(
            "pipeline.max_stage_wait_secs must be >= poll_interval_secs",
        ));
    }
    if p.max_workflow_age_secs < p.max_stage_wait_secs {
        return Err(ConfigError::Invalid(
            "pipeline.max_workflow_age_secs must be >= max_stage_wait_secs",
        ));
    }
    if p.sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid("pipeline.sweep_interval_secs must be > 0"));
    }
    if p.platforms.is_empty() {
        return Err(ConfigError::Invalid("pipeline.platforms must be non-empty"));
    }

    for kind in ServiceKind::ALL {
        validate_service(cfg.services.get(kind))?;
    }

    let b = &cfg.budgets;
    if !(0.0..=100.0).contains(&b.warning_percent) || !(0.0..=100.0).contains(&b.critical_percent) {
        return Err(ConfigError::Invalid("budgets thresholds must be within 0..=100"));
    }
    if b.warning_percent > b.critical_percent {
        return Err(ConfigError::Invalid(
            "budgets.warning_percent must not exceed critical_percent",
        ));
    }
    if b.daily_units.values().chain(b.monthly_units.values()).any(|v| *v <= 0.0) {
        return Err(ConfigError::Invalid("budget limits must be > 0"));
    }

    Ok(())
}

fn validate_service(svc: &ServiceConfig) -> Result<(), ConfigError> {
    if Url::parse(&svc.base_url).is_err() {
        return Err(ConfigError::Invalid("services.*.base_url must be an absolute URL"));
    }
    if svc.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("services.*.api_key must be non-empty"));
    }
    if svc.submit_path.trim().is_empty() {
        return Err(ConfigError::Invalid("services.*.submit_path must be non-empty"));
    }
    if !svc.status_path.contains("{job_id}") {
        return Err(ConfigError::Invalid(
            "services.*.status_path must contain a {job_id} placeholder",
        ));
    }
    if svc.timeout_secs == 0 {
        return Err(ConfigError::Invalid("services.*.timeout_secs must be > 0"));
    }
    if svc.rate_limit.max_calls == 0 || svc.rate_limit.window_secs == 0 {
        return Err(ConfigError::Invalid("services.*.rate_limit values must be > 0"));
    }
    if svc.circuit_breaker.failure_threshold == 0 {
        return Err(ConfigError::Invalid(
            "services.*.circuit_breaker.failure_threshold must be > 0",
        ));
    }
    if svc.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("services.*.retry.max_attempts must be >= 1"));
    }
    if svc.retry.max_delay_ms < svc.retry.base_delay_ms {
        return Err(ConfigError::Invalid(
            "services.*.retry.max_delay_ms must be >= base_delay_ms",
        ));
    }
    if svc.cost.units_per_call < 0.0 || svc.cost.cost_per_unit_usd < 0.0 {
        return Err(ConfigError::Invalid("services.*.cost values must be >= 0"));
    }
    Ok(())
}

/// Example configuration; also the fixture used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "0.0.0.0:8080"
  public_base_url: "https://pipeline.example.com"
  tick_interval_secs: 3600
  brands:
    - ownerfi
    - carz
  catalog_path: "./catalog.yaml"

pipeline:
  poll_interval_secs: 45
  max_stage_wait_secs: 1800
  max_workflow_age_secs: 10800
  sweep_interval_secs: 900
  platforms:
    - instagram
    - tiktok
    - youtube

script:
  text: "Take a look at {label} in {city}."
  title: "{label}"
  caption: "{label} in {city} #ownerfinancing"

services:
  render:
    base_url: "https://render.example.com/"
    api_key: "RENDER_API_KEY"
    submit_path: "v2/videos"
    status_path: "v1/videos/{job_id}"
    timeout_secs: 30
    rate_limit: { max_calls: 30, window_secs: 60 }
    circuit_breaker: { failure_threshold: 5, cooldown_secs: 60 }
    retry: { max_attempts: 3, base_delay_ms: 1000, max_delay_ms: 60000 }
    cost: { units_per_call: 1.0, cost_per_unit_usd: 0.50 }
  caption:
    base_url: "https://caption.example.com/"
    api_key: "CAPTION_API_KEY"
    submit_path: "v1/projects"
    status_path: "v1/projects/{job_id}"
    timeout_secs: 30
    rate_limit: { max_calls: 8, window_secs: 60 }
    circuit_breaker: { failure_threshold: 5, cooldown_secs: 60 }
    retry: { max_attempts: 3, base_delay_ms: 1000, max_delay_ms: 60000 }
    cost: { units_per_call: 1.0, cost_per_unit_usd: 0.25 }
  schedule:
    base_url: "https://schedule.example.com/"
    api_key: "SCHEDULE_API_KEY"
    submit_path: "v1/posts"
    status_path: "v1/posts/{job_id}"
    timeout_secs: 30
    rate_limit: { max_calls: 60, window_secs: 60 }
    circuit_breaker: { failure_threshold: 5, cooldown_secs: 60 }
    retry: { max_attempts: 3, base_delay_ms: 1000, max_delay_ms: 60000 }
    cost: { units_per_call: 1.0, cost_per_unit_usd: 0.0 }

budgets:
  warning_percent: 80
  critical_percent: 95
  enforce: false
  daily_units:
    render: 50
    caption: 50
  monthly_units:
    render: 660
    caption: 600
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.brands, vec!["ownerfi", "carz"]);
        assert_eq!(cfg.budgets.daily_units.get(&ServiceKind::Render), Some(&50.0));
        assert!(!cfg.services.render.cost.bill_failed_attempts);
    }

    #[test]
    fn invalid_brand_slug() {
        let mut cfg = example_cfg();
        cfg.app.brands.push("Owner Fi".into());
        match validate(&cfg).unwrap_err() {
            ConfigError::InvalidBrand(b) => assert_eq!(b, "Owner Fi"),
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn invalid_listen_addr_and_public_url() {
        let mut cfg = example_cfg();
        cfg.app.listen_addr = "localhost".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("listen_addr")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.app.public_base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_service_settings() {
        let mut cfg = example_cfg();
        cfg.services.caption.status_path = "v1/projects".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("{job_id}")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.services.render.retry.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.services.schedule.circuit_breaker.failure_threshold = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_pipeline_timing() {
        let mut cfg = example_cfg();
        cfg.pipeline.max_stage_wait_secs = 10;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_stage_wait_secs")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_budget_thresholds() {
        let mut cfg = example_cfg();
        cfg.budgets.warning_percent = 99.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.pipeline.platforms.len(), 3);
    }
}
