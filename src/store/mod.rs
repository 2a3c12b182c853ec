//! Durable state: endpoint config, run log, alerts and duty records.
//!
//! The orchestration layer only sees [`IngestStore`]; [`SqliteStore`] is the
//! bundled implementation.

pub mod sqlite;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::crosscheck::CrossCheckOutput;
use crate::error::IngestResult;
use crate::ingest::types::{ConditionalHeaders, SourceEndpoint, SourceRole};

pub use sqlite::SqliteStore;

const PULL_RUNNING: u8 = 0;
const PULL_CANCELLED: u8 = 1;
const PULL_COMMITTING: u8 = 2;

/// Shared cancellation flag for one province pull. Cancelling and claiming
/// the commit are mutually exclusive: whichever happens first wins.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` when the store already claimed the commit; the write will land.
    pub fn cancel(&self) -> bool {
        match self
            .0
            .compare_exchange(PULL_RUNNING, PULL_CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(state) => state == PULL_CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == PULL_CANCELLED
    }

    /// Called by the store right before commit. `false` means the pull was
    /// cancelled and the transaction must roll back.
    pub fn claim_commit(&self) -> bool {
        self.0
            .compare_exchange(PULL_RUNNING, PULL_COMMITTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// Succeeded with warnings (lenient stale date, discovery, fallback).
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// One endpoint attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub province_slug: String,
    pub endpoint_id: Option<i64>,
    pub source_name: String,
    pub source_url: String,
    pub role: SourceRole,
    pub adapter: String,
    pub status: RunStatus,
    pub http_status: Option<u16>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub records: usize,
    pub payload_sha256: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AdapterFailed,
    FallbackUsed,
    FallbackFailed,
    ParserErrorThreshold,
    NoActiveEndpoints,
    ProvinceFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdapterFailed => "adapter_failed",
            Self::FallbackUsed => "fallback_used",
            Self::FallbackFailed => "fallback_failed",
            Self::ParserErrorThreshold => "parser_error_threshold",
            Self::NoActiveEndpoints => "no_active_endpoints",
            Self::ProvinceFailed => "province_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub province_slug: String,
    pub endpoint_id: Option<i64>,
    pub source_url: Option<String>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Attempt counts of one endpoint over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub total: u32,
    pub failed: u32,
}

impl RunStats {
    pub fn failure_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.failed) * 100.0 / f64::from(self.total)
        }
    }
}

/// What one province transaction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub records_upserted: usize,
    pub evidence_rows: usize,
    pub conflicts_new: usize,
    pub conflicts_seen: usize,
    pub expired: usize,
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Enabled endpoints configured for a province. Empty when none are.
    async fn endpoints_for(&self, province_slug: &str) -> IngestResult<Vec<SourceEndpoint>>;

    /// District names already stored for a province.
    async fn known_districts(&self, province_slug: &str) -> IngestResult<Vec<String>>;

    /// Latest validators per source URL, from successful runs.
    async fn latest_validators(&self) -> IngestResult<Vec<(String, ConditionalHeaders)>>;

    async fn record_run(&self, run: &RunRecord) -> IngestResult<i64>;

    async fn raise_alert(&self, alert: &AlertRecord) -> IngestResult<i64>;

    async fn run_stats_since(&self, source_url: &str, since: DateTime<Utc>) -> IngestResult<RunStats>;

    async fn alert_exists_since(
        &self,
        source_url: &str,
        kind: AlertKind,
        since: DateTime<Utc>,
    ) -> IngestResult<bool>;

    /// Write one province's verified records, evidence and conflicts in a
    /// single transaction, then expire records of the same duty dates that
    /// this pull no longer lists. Rolls back if `cancel` is set.
    async fn persist_province(
        &self,
        province_slug: &str,
        output: &CrossCheckOutput,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> IngestResult<PersistSummary>;

    /// Provinces with at least one enabled endpoint row.
    async fn provinces_with_endpoints(&self) -> IngestResult<Vec<String>>;
}

/// One duty record as read back, for reports and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DutyRow {
    pub district_slug: String,
    pub pharmacy_name: String,
    pub normalized_name: String,
    pub address: String,
    pub phone: String,
    pub duty_date: NaiveDate,
    pub duty_start: String,
    pub duty_end: String,
    pub confidence: u8,
    pub verification_source_count: u8,
    pub is_degraded: bool,
    pub last_verified_at: String,
}
