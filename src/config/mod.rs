// src/config/mod.rs
//! Process configuration.
//!
//! Lookup order: `$DUTY_INGEST_CONFIG`, then `config/ingest.toml`, then
//! built-in defaults. Environment variables override single values after
//! the file is read; out-of-range values are pulled back to sane bounds.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf};

use crate::source_weights::AuthorityWeights;

const ENV_PATH: &str = "DUTY_INGEST_CONFIG";

pub const MIN_FETCH_TIMEOUT_SECS: u64 = 10;
pub const MAX_FETCH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub authority: AuthorityWeights,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_db_path() -> String {
    "data/duty.sqlite".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    12
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
        .to_string()
}
fn default_accept_language() -> String {
    "tr-TR,tr;q=0.9,en-US;q=0.7,en;q=0.6".to_string()
}
fn default_discovery_limit() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Per-request hard timeout, clamped to 10–15 s.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    /// Related URLs tried when a page parses to zero rows.
    #[serde(default = "default_discovery_limit")]
    pub discovery_limit: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
            discovery_limit: default_discovery_limit(),
        }
    }
}

fn default_min_runs() -> u32 {
    5
}
fn default_failure_pct() -> f64 {
    50.0
}
fn default_window_hours() -> i64 {
    24
}
fn default_dedup_minutes() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Try the static seed when every primary endpoint failed.
    #[serde(default)]
    pub fallback_primary: bool,
    /// Same for the secondary role.
    #[serde(default)]
    pub fallback_secondary: bool,
    #[serde(default = "default_min_runs")]
    pub threshold_min_runs: u32,
    #[serde(default = "default_failure_pct")]
    pub threshold_failure_pct: f64,
    #[serde(default = "default_window_hours")]
    pub threshold_window_hours: i64,
    #[serde(default = "default_dedup_minutes")]
    pub alert_dedup_minutes: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fallback_primary: false,
            fallback_secondary: false,
            threshold_min_runs: default_min_runs(),
            threshold_failure_pct: default_failure_pct(),
            threshold_window_hours: default_window_hours(),
            alert_dedup_minutes: default_dedup_minutes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1` (1-based `attempt`).
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_secs.max(self.base_backoff_secs));
        std::time::Duration::from_secs(secs)
    }

    pub fn recurring_default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_secs: 30,
            max_backoff_secs: 300,
        }
    }

    pub fn pull_now_default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_secs: 5,
            max_backoff_secs: 60,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_interval_secs() -> u64 {
    900
}
fn default_budget_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_interval_secs")]
    pub recurring_interval_secs: u64,
    /// Whole-pull budget; must leave room for one fetch + parse cycle.
    #[serde(default = "default_budget_secs")]
    pub province_budget_secs: u64,
    #[serde(default = "RetryPolicy::recurring_default")]
    pub recurring: RetryPolicy,
    #[serde(default = "RetryPolicy::pull_now_default")]
    pub pull_now: RetryPolicy,
    /// Provinces pulled on the recurring timer; empty means every province
    /// with endpoints.
    #[serde(default)]
    pub provinces: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            recurring_interval_secs: default_interval_secs(),
            province_budget_secs: default_budget_secs(),
            recurring: RetryPolicy::recurring_default(),
            pull_now: RetryPolicy::pull_now_default(),
            provinces: Vec::new(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub slack_webhook: Option<String>,
    #[serde(default)]
    pub discord_webhook: Option<String>,
    /// Quiet period per (province, alert kind).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            slack_webhook: None,
            discord_webhook: None,
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// `host:port` for the Prometheus endpoint; disabled when unset.
    #[serde(default)]
    pub addr: Option<String>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg: AppConfig =
            toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    /// File lookup, then env overrides, then sanitizing.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            Self::load_from_file(&pb)?
        } else {
            let default_p = PathBuf::from("config/ingest.toml");
            if default_p.exists() {
                Self::load_from_file(&default_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env()?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = env_parse::<u64>("FETCH_TIMEOUT_SECS")? {
            self.fetch.timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("PROVINCE_BUDGET_SECS")? {
            self.scheduler.province_budget_secs = v;
        }
        if let Some(v) = env_parse::<usize>("WORKER_COUNT")? {
            self.scheduler.workers = v;
        }
        if let Some(v) = env_parse::<u64>("RECURRING_INTERVAL_SECS")? {
            self.scheduler.recurring_interval_secs = v;
        }
        if let Ok(v) = env::var("ENABLE_STATIC_FALLBACK") {
            let on = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
            self.orchestrator.fallback_primary = on;
            self.orchestrator.fallback_secondary = on;
        }
        if let Ok(v) = env::var("METRICS_ADDR") {
            self.metrics.addr = (!v.trim().is_empty()).then_some(v);
        }
        if let Ok(v) = env::var("SLACK_WEBHOOK_URL") {
            self.notify.slack_webhook = Some(v);
        }
        if let Ok(v) = env::var("DISCORD_WEBHOOK_URL") {
            self.notify.discord_webhook = Some(v);
        }
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.fetch.timeout_secs = self
            .fetch
            .timeout_secs
            .clamp(MIN_FETCH_TIMEOUT_SECS, MAX_FETCH_TIMEOUT_SECS);
        // Budget covers at least one full fetch plus parsing.
        let floor = self.fetch.timeout_secs + 5;
        if self.scheduler.province_budget_secs < floor {
            self.scheduler.province_budget_secs = floor;
        }
        if self.scheduler.workers == 0 {
            self.scheduler.workers = default_workers();
        }
        if self.scheduler.recurring_interval_secs == 0 {
            self.scheduler.recurring_interval_secs = default_interval_secs();
        }
        if !(0.0..=100.0).contains(&self.orchestrator.threshold_failure_pct) {
            self.orchestrator.threshold_failure_pct = default_failure_pct();
        }
        if self.orchestrator.threshold_window_hours <= 0 {
            self.orchestrator.threshold_window_hours = default_window_hours();
        }
        if self.orchestrator.alert_dedup_minutes < 0 {
            self.orchestrator.alert_dedup_minutes = default_dedup_minutes();
        }
        for policy in [&mut self.scheduler.recurring, &mut self.scheduler.pull_now] {
            policy.max_attempts = policy.max_attempts.max(1);
        }
        self.scheduler.provinces = self
            .scheduler
            .provinces
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{key} must be a number, got '{v}'")),
        Err(_) => Ok(None),
    }
}
