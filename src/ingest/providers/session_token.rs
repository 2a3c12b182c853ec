//! Two-request flow: GET the landing page for a session cookie and a hidden
//! token, then POST the token to the AJAX endpoint that returns the roster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::generic::{accept_rows, parse_rows, payload_dates};
use super::http::HttpClient;
use crate::error::{IngestError, IngestResult};
use crate::ingest::freshness;
use crate::ingest::types::{
    AdapterSpec, ConditionalHeaders, FetchContext, FetchOutcome, SourceAdapter, SourceEndpoint,
};

static SEL_META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[name][content]").unwrap());
static SEL_INPUT: Lazy<Selector> = Lazy::new(|| Selector::parse("input[name][value]").unwrap());

/// Pull the token named `field` out of a page: hidden input, meta tag, or a
/// `field = "..."` / `field: '...'` literal in inline script.
pub fn extract_token(html: &str, field: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let from_input = doc
        .select(&SEL_INPUT)
        .find(|el| el.value().attr("name") == Some(field))
        .and_then(|el| el.value().attr("value"));
    let from_meta = || {
        doc.select(&SEL_META)
            .find(|el| el.value().attr("name") == Some(field))
            .and_then(|el| el.value().attr("content"))
    };
    if let Some(tok) = from_input.or_else(from_meta).map(str::trim).filter(|t| !t.is_empty()) {
        return Some(tok.to_string());
    }

    let pattern = format!(
        r#"['"]?\b{}\b['"]?\s*[:=]\s*['"]([^'"]{{4,}})['"]"#,
        regex::escape(field)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Configured form fields as pairs, token appended.
fn form_pairs(form: &BTreeMap<String, String>, field: &str, token: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = form.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.push((field.to_string(), token.to_string()));
    pairs
}

pub struct SessionTokenAdapter {
    http: HttpClient,
}

impl SessionTokenAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

static RE_BODY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body[^>]*>").unwrap());

#[async_trait]
impl SourceAdapter for SessionTokenAdapter {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        _conditional: &ConditionalHeaders,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome> {
        let AdapterSpec::SessionToken {
            ajax_url,
            token_field,
            form,
        } = &endpoint.adapter
        else {
            return Err(IngestError::fetch(&endpoint.url, None, "endpoint is not a session-token source"));
        };

        let session = self.http.session();
        let page = session.get(&endpoint.url, &ConditionalHeaders::default()).await?;
        let token = extract_token(&page.body, token_field).ok_or_else(|| {
            IngestError::fetch(&endpoint.url, Some(page.status), format!("token '{token_field}' not found"))
        })?;
        tracing::debug!(
            target: "ingest",
            endpoint = %endpoint.source_name,
            token_len = token.len(),
            "session token extracted"
        );

        let headers = vec![
            ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
            ("Referer".to_string(), page.final_url.clone()),
        ];
        let resp = session
            .post_form(ajax_url, &form_pairs(form, token_field, &token), &headers)
            .await?;

        let fetched_at = Utc::now();
        // Fragments rarely carry a date; the landing page usually does.
        let mut dates = payload_dates(endpoint, &resp.body);
        if dates.is_empty() && !RE_BODY_TAG.is_match(&resp.body) {
            dates = freshness::page_dates(&page.body, &endpoint.date_selectors);
        }
        let verdict = freshness::judge(dates, &ctx.accepted_dates);
        let rows = parse_rows(endpoint, &resp.body, verdict.roster_date(ctx.duty_date));
        let (batch, warnings) = accept_rows(endpoint, rows, &verdict, ctx, fetched_at)
            .map_err(|e| e.with_payload(&resp.body))?;

        Ok(FetchOutcome {
            batch: Some(batch),
            http_status: resp.status,
            etag: resp.etag,
            last_modified: resp.last_modified,
            raw_payload: resp.body,
            warnings,
        })
    }

    fn name(&self) -> &'static str {
        "session_token"
    }
}
