//! Per-district POST pagination: the landing page lists districts in a
//! `<select>`, and each district's roster comes back from its own POST.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use scraper::{Html, Selector};

use super::generic::{accept_rows, is_json_payload, parse_rows, payload_dates};
use super::http::HttpClient;
use crate::error::{IngestError, IngestResult};
use crate::ingest::freshness;
use crate::ingest::types::{
    AdapterSpec, ConditionalHeaders, FetchContext, FetchOutcome, SourceAdapter, SourceEndpoint,
};
use crate::normalize::{fold_upper, normalize_text};

/// District POSTs in flight at once within one session.
const DISTRICT_CONCURRENCY: usize = 4;

/// One `<option>`: the value to post and its visible label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistrictOption {
    pub value: String,
    pub label: String,
}

fn is_placeholder(label: &str) -> bool {
    let folded = fold_upper(label);
    folded.is_empty()
        || folded.starts_with("SECINIZ")
        || folded.starts_with("ILCE SEC")
        || folded.starts_with("TUMU")
        || folded == "-"
}

/// Options of `select[name=select_name]`, placeholders and duplicates removed.
pub fn district_options(html: &str, select_name: &str) -> Vec<DistrictOption> {
    let Ok(sel) = Selector::parse(&format!(r#"select[name="{select_name}"] option"#)) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);
    let mut out: Vec<DistrictOption> = Vec::new();
    for opt in doc.select(&sel) {
        let label = normalize_text(&opt.text().collect::<String>());
        let value = opt
            .value()
            .attr("value")
            .map(str::trim)
            .map(str::to_string)
            .unwrap_or_else(|| label.clone());
        if value.is_empty() || value == "0" || is_placeholder(&label) {
            continue;
        }
        if out.iter().any(|o| o.value == value) {
            continue;
        }
        out.push(DistrictOption { value, label });
    }
    out
}

pub struct DistrictFormAdapter {
    http: HttpClient,
}

impl DistrictFormAdapter {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SourceAdapter for DistrictFormAdapter {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        _conditional: &ConditionalHeaders,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome> {
        let AdapterSpec::DistrictForm {
            select_name,
            post_url,
            form,
        } = &endpoint.adapter
        else {
            return Err(IngestError::fetch(&endpoint.url, None, "endpoint is not a district-form source"));
        };

        let session = self.http.session();
        let page = session.get(&endpoint.url, &ConditionalHeaders::default()).await?;
        let options = district_options(&page.body, select_name);
        if options.is_empty() {
            return Err(IngestError::parse(&endpoint.source_name).with_payload(&page.body));
        }
        let target = post_url.clone().unwrap_or_else(|| page.final_url.clone());

        // `buffered` keeps option order, so the merged rows stay deterministic.
        // Each request owns its inputs; clones share the session cookie jar.
        let responses: Vec<(DistrictOption, IngestResult<_>)> = stream::iter(options.clone())
            .map(|opt| {
                let fields = form_for(form, select_name, &opt.value);
                let session = session.clone();
                let target = target.clone();
                async move {
                    let res = session.post_form(&target, &fields, &[]).await;
                    (opt, res)
                }
            })
            .buffered(DISTRICT_CONCURRENCY)
            .collect()
            .await;

        let mut warnings = Vec::new();
        let mut fetched = Vec::with_capacity(responses.len());
        for (opt, res) in responses {
            match res {
                Ok(resp) => fetched.push((opt, resp)),
                Err(e) => {
                    tracing::warn!(
                        target: "ingest",
                        endpoint = %endpoint.source_name,
                        district = %opt.label,
                        error = %e,
                        "district page failed"
                    );
                    warnings.push(format!("district {} failed: {e}", opt.label));
                }
            }
        }
        if fetched.is_empty() {
            return Err(IngestError::fetch(target, None, "every district request failed"));
        }

        let json = fetched.iter().any(|(_, resp)| is_json_payload(endpoint, &resp.body));
        let mut dates: Vec<NaiveDate> = Vec::new();
        if !json {
            dates = freshness::page_dates(&page.body, &endpoint.date_selectors);
        }
        for (_, resp) in &fetched {
            for d in payload_dates(endpoint, &resp.body) {
                if !dates.contains(&d) {
                    dates.push(d);
                }
            }
        }
        if json {
            dates.sort_unstable_by(|a, b| b.cmp(a));
            if dates.is_empty() {
                dates = freshness::page_dates(&page.body, &endpoint.date_selectors);
            }
        }
        let verdict = freshness::judge(dates, &ctx.accepted_dates);
        let roster_date = verdict.roster_date(ctx.duty_date);

        let mut rows = Vec::new();
        let mut payloads = Vec::with_capacity(fetched.len());
        let mut last_status = page.status;
        for (opt, resp) in fetched {
            last_status = resp.status;
            let mut district_rows = parse_rows(endpoint, &resp.body, roster_date);
            for r in district_rows.iter_mut().filter(|r| r.district_name.trim().is_empty()) {
                r.district_name = opt.label.clone();
            }
            rows.extend(district_rows);
            payloads.push(resp.body);
        }

        let fetched_at = Utc::now();
        let raw_payload = payloads.join("\n");
        let (batch, gate_warnings) = accept_rows(endpoint, rows, &verdict, ctx, fetched_at)
            .map_err(|e| e.with_payload(&raw_payload))?;
        warnings.extend(gate_warnings);
        tracing::info!(
            target: "ingest",
            endpoint = %endpoint.source_name,
            districts = options.len(),
            rows = batch.records.len(),
            "district form merged"
        );

        Ok(FetchOutcome {
            batch: Some(batch),
            http_status: last_status,
            etag: None,
            last_modified: None,
            raw_payload,
            warnings,
        })
    }

    fn name(&self) -> &'static str {
        "district_form"
    }
}

fn form_for(form: &BTreeMap<String, String>, select_name: &str, value: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = form
        .iter()
        .filter(|(k, _)| k.as_str() != select_name)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    fields.push((select_name.to_string(), value.to_string()));
    fields
}
