//! Plain GET adapter, plus the payload-to-batch steps every adapter shares.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, histogram};

use super::discovery;
use super::http::HttpClient;
use crate::error::{IngestError, IngestResult};
use crate::ingest::types::{
    ConditionalHeaders, FetchContext, FetchOutcome, PayloadFormat, SourceAdapter, SourceBatch, SourceEndpoint,
};
use crate::ingest::build_batch_for_date;
use crate::ingest::freshness::{self, Freshness};
use crate::parse::{json, looks_like_json, parse_payload, ParseContext, ParsedRow};

/// Does this body get treated as JSON for this endpoint?
pub(crate) fn is_json_payload(endpoint: &SourceEndpoint, body: &str) -> bool {
    match endpoint.format {
        PayloadFormat::Json => true,
        PayloadFormat::Html => false,
        PayloadFormat::Auto => looks_like_json(body),
    }
}

/// Dates a payload claims: record date fields for JSON, page text otherwise.
pub(crate) fn payload_dates(endpoint: &SourceEndpoint, body: &str) -> Vec<NaiveDate> {
    if is_json_payload(endpoint, body) {
        json::record_dates(body)
    } else {
        freshness::page_dates(body, &endpoint.date_selectors)
    }
}

/// Run the parser registry over one body. Dated JSON rows are kept only
/// when they belong to `roster_date`.
pub(crate) fn parse_rows(endpoint: &SourceEndpoint, body: &str, roster_date: NaiveDate) -> Vec<ParsedRow> {
    let t0 = std::time::Instant::now();
    let pctx = ParseContext {
        accepted_dates: std::slice::from_ref(&roster_date),
    };
    let out = parse_payload(body, endpoint.format, endpoint.parser_key, &pctx);
    histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    tracing::debug!(
        target: "ingest",
        endpoint = %endpoint.source_name,
        strategy = out.strategy.map(|k| k.as_str()).unwrap_or("none"),
        rows = out.rows.len(),
        "payload parsed"
    );
    out.rows
}

/// Accept parsed rows as a batch: zero rows is a parse failure, then the
/// freshness gate applies and the rows are stamped with the roster date.
pub(crate) fn accept_rows(
    endpoint: &SourceEndpoint,
    rows: Vec<ParsedRow>,
    verdict: &Freshness,
    ctx: &FetchContext,
    fetched_at: DateTime<Utc>,
) -> IngestResult<(SourceBatch, Vec<String>)> {
    if rows.is_empty() {
        return Err(IngestError::parse(&endpoint.source_name));
    }
    let mut warnings = Vec::new();
    if let Some(w) = freshness::gate(endpoint, verdict, &ctx.accepted_dates)? {
        warnings.push(w);
    }
    let duty_date = verdict.roster_date(ctx.duty_date);
    Ok((build_batch_for_date(endpoint, rows, ctx, duty_date, fetched_at), warnings))
}

/// Parse + gate one body in one go.
pub(crate) fn process_body(
    endpoint: &SourceEndpoint,
    body: &str,
    ctx: &FetchContext,
    fetched_at: DateTime<Utc>,
) -> IngestResult<(SourceBatch, Vec<String>)> {
    let verdict = freshness::judge(payload_dates(endpoint, body), &ctx.accepted_dates);
    let rows = parse_rows(endpoint, body, verdict.roster_date(ctx.duty_date));
    accept_rows(endpoint, rows, &verdict, ctx, fetched_at).map_err(|e| e.with_payload(body))
}

pub struct GenericAdapter {
    http: HttpClient,
}

impl GenericAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Try duty-related URLs linked from a page that yielded no rows.
    async fn discover(
        &self,
        endpoint: &SourceEndpoint,
        page: &str,
        base: &str,
        ctx: &FetchContext,
    ) -> Option<(SourceBatch, Vec<String>, String)> {
        for url in discovery::candidates(page, base, self.http.discovery_limit()) {
            let resp = match self.http.get(&url, &ConditionalHeaders::default()).await {
                Ok(r) if !r.not_modified() => r,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(target: "ingest", url = %url, error = %e, "discovery candidate failed");
                    continue;
                }
            };
            match process_body(endpoint, &resp.body, ctx, Utc::now()) {
                Ok((batch, mut warnings)) => {
                    counter!("ingest_discovery_used_total").increment(1);
                    tracing::info!(
                        target: "ingest",
                        endpoint = %endpoint.source_name,
                        url = %url,
                        rows = batch.records.len(),
                        "roster recovered from discovered url"
                    );
                    warnings.push(format!("rows taken from discovered url {url}"));
                    return Some((batch, warnings, resp.body));
                }
                Err(e) => {
                    tracing::debug!(target: "ingest", url = %url, error = %e, "discovery candidate unusable");
                }
            }
        }
        None
    }
}

#[async_trait]
impl SourceAdapter for GenericAdapter {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        conditional: &ConditionalHeaders,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome> {
        let resp = self.http.get(&endpoint.url, conditional).await?;
        if resp.not_modified() {
            return Ok(FetchOutcome {
                batch: None,
                http_status: resp.status,
                etag: resp.etag.or_else(|| conditional.etag.clone()),
                last_modified: resp.last_modified.or_else(|| conditional.last_modified.clone()),
                raw_payload: String::new(),
                warnings: Vec::new(),
            });
        }

        let fetched_at = Utc::now();
        let (batch, warnings, raw_payload) = match process_body(endpoint, &resp.body, ctx, fetched_at) {
            Ok((batch, warnings)) => (batch, warnings, resp.body),
            Err(IngestError::Parse { .. }) if !is_json_payload(endpoint, &resp.body) => {
                match self.discover(endpoint, &resp.body, &resp.final_url, ctx).await {
                    Some(found) => found,
                    None => return Err(IngestError::parse(&endpoint.source_name).with_payload(&resp.body)),
                }
            }
            Err(e) => return Err(e),
        };

        Ok(FetchOutcome {
            batch: Some(batch),
            http_status: resp.status,
            etag: resp.etag,
            last_modified: resp.last_modified,
            raw_payload,
            warnings,
        })
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}
