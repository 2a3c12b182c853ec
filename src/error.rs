//! Error kinds raised along the ingestion pipeline.
//!
//! Endpoint-level errors (`Fetch`, `Parse`, `StaleDate`) are absorbed by the
//! orchestrator; province-level errors propagate to the scheduler, which
//! decides about retries via [`IngestError::is_retryable`].

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch {
        url: String,
        status: Option<u16>,
        reason: String,
    },
    #[error("no usable rows extracted from {source_name}")]
    Parse {
        source_name: String,
        /// SHA-256 of the rejected payload, when one was fetched.
        payload_sha256: Option<String>,
    },
    #[error("{source_name} describes {found:?}, expected one of {accepted:?}")]
    StaleDate {
        source_name: String,
        found: Option<NaiveDate>,
        accepted: Vec<NaiveDate>,
        payload_sha256: Option<String>,
    },
    #[error("no active endpoints for province '{0}'")]
    NoEndpoint(String),
    #[error("cross-check produced no records for province '{0}'")]
    NoRecords(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("province '{province}' exceeded its {budget_secs}s budget")]
    Timeout { province: String, budget_secs: u64 },
    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn fetch(url: impl Into<String>, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn parse(source_name: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            payload_sha256: None,
        }
    }

    /// Attach the digest of the payload that was rejected. Only `Parse` and
    /// `StaleDate` carry one; an existing digest is kept.
    pub fn with_payload(mut self, payload: &str) -> Self {
        if let Self::Parse { payload_sha256, .. } | Self::StaleDate { payload_sha256, .. } = &mut self {
            if payload_sha256.is_none() && !payload.is_empty() {
                *payload_sha256 = Some(crate::ingest::payload_digest(payload));
            }
        }
        self
    }

    pub fn payload_sha256(&self) -> Option<&str> {
        match self {
            Self::Parse { payload_sha256, .. } | Self::StaleDate { payload_sha256, .. } => payload_sha256.as_deref(),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if the failure came from a response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    /// A missing source configuration will not fix itself on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoEndpoint(_))
    }

    /// Short machine label used for metrics and run rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch",
            Self::Parse { .. } => "parse",
            Self::StaleDate { .. } => "stale_date",
            Self::NoEndpoint(_) => "no_endpoint",
            Self::NoRecords(_) => "no_records",
            Self::Store(_) => "store",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
