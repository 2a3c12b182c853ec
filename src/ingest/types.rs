// src/ingest/types.rs
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestResult;
use crate::parse::ParserKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRole {
    Primary,
    Secondary,
}

impl SourceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Auto,
    Html,
    Json,
}

/// How an endpoint is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    /// Plain GET, content-sniffed.
    #[default]
    Generic,
    /// GET the page, lift a hidden token, POST it to an AJAX endpoint.
    SessionToken {
        ajax_url: String,
        token_field: String,
        #[serde(default)]
        form: BTreeMap<String, String>,
    },
    /// One POST per `<select>` option (district), results merged.
    DistrictForm {
        select_name: String,
        #[serde(default)]
        post_url: Option<String>,
        #[serde(default)]
        form: BTreeMap<String, String>,
    },
}

/// One scrape target. Loaded fresh for every pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    #[serde(default)]
    pub id: i64,
    pub province_slug: String,
    pub source_name: String,
    #[serde(default)]
    pub source_type: String,
    /// 0–100 trust prior.
    pub authority_weight: u8,
    pub url: String,
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default)]
    pub parser_key: Option<ParserKey>,
    pub role: SourceRole,
    #[serde(default)]
    pub adapter: AdapterSpec,
    /// Missing or outdated page date is a hard failure.
    #[serde(default)]
    pub strict_date: bool,
    /// CSS selectors whose text carries the roster date.
    #[serde(default)]
    pub date_selectors: Vec<String>,
}

/// Cross-source join key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MatchKey {
    pub duty_date: NaiveDate,
    pub district_slug: String,
    pub normalized_name: String,
}

/// One pharmacy-duty observation from one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub district_name: String,
    pub district_slug: String,
    pub pharmacy_name: String,
    pub normalized_name: String,
    pub address: String,
    pub phone: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub duty_date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            duty_date: self.duty_date,
            district_slug: self.district_slug.clone(),
            normalized_name: self.normalized_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMeta {
    pub endpoint_id: Option<i64>,
    pub source_name: String,
    pub source_url: String,
    pub role: SourceRole,
    pub authority_weight: u8,
}

impl SourceMeta {
    pub fn for_endpoint(ep: &SourceEndpoint) -> Self {
        Self {
            endpoint_id: (ep.id > 0).then_some(ep.id),
            source_name: ep.source_name.clone(),
            source_url: ep.url.clone(),
            role: ep.role,
            authority_weight: ep.authority_weight.min(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceBatch {
    pub meta: SourceMeta,
    pub records: Vec<SourceRecord>,
}

/// Validators remembered from the last successful fetch of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ConditionalHeaders {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Everything an adapter learned from one attempt.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// `None` when the source answered `304 Not Modified`.
    pub batch: Option<SourceBatch>,
    pub http_status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub raw_payload: String,
    /// Non-fatal issues (lenient stale date, discovery used).
    pub warnings: Vec<String>,
}

impl FetchOutcome {
    pub fn not_modified(&self) -> bool {
        self.http_status == 304
    }
}

/// Per-pull facts adapters need besides the endpoint itself.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub now: DateTime<Utc>,
    pub duty_date: NaiveDate,
    pub accepted_dates: Vec<NaiveDate>,
    /// Extra district names known for the province (from the store).
    pub known_districts: Vec<String>,
}

impl FetchContext {
    pub fn at(now: DateTime<Utc>, known_districts: Vec<String>) -> Self {
        Self {
            now,
            duty_date: crate::duty_window::active_duty_date(now),
            accepted_dates: crate::duty_window::accepted_dates(now),
            known_districts,
        }
    }
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        conditional: &ConditionalHeaders,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome>;

    fn name(&self) -> &'static str;
}
