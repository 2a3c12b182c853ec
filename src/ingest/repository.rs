//! Source repository: which endpoints a province has, and how one role
//! (primary or secondary) gets resolved into at most one batch.
//!
//! Endpoints of a role are tried in order until one succeeds. Every attempt
//! is logged as a run; failures raise alerts and, when enabled for the role,
//! hand over to the static fallback. After each run the endpoint's recent
//! failure rate is checked against the configured threshold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use metrics::counter;
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::error::{IngestError, IngestResult};
use crate::ingest::config::{builtin_endpoints_for, builtin_province_slugs};
use crate::ingest::payload_digest;
use crate::ingest::providers::{fallback_endpoint, AdapterResolver};
use crate::ingest::types::{
    ConditionalHeaders, FetchContext, FetchOutcome, SourceAdapter, SourceBatch, SourceEndpoint, SourceRole,
};
use crate::notify::{AlertEvent, NotifyHub};
use crate::source_weights::AuthorityWeights;
use crate::store::{AlertKind, AlertRecord, IngestStore, RunRecord, RunStatus, Severity};

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    headers: ConditionalHeaders,
    batch: Option<SourceBatch>,
}

/// Validators and last accepted batch per source URL. Process-scoped:
/// created at start, optionally seeded from the run log, injected into the
/// repository.
#[derive(Debug, Default)]
pub struct ConditionalCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ConditionalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validators loaded from persisted runs. Batches are not persisted, so
    /// a `304` against these triggers the unconditional retry.
    pub fn seed(&self, validators: Vec<(String, ConditionalHeaders)>) {
        if let Ok(mut map) = self.entries.lock() {
            for (url, headers) in validators {
                map.entry(url).or_default().headers = headers;
            }
        }
    }

    pub fn headers(&self, url: &str) -> ConditionalHeaders {
        self.entries
            .lock()
            .ok()
            .and_then(|m| m.get(url).map(|e| e.headers.clone()))
            .unwrap_or_default()
    }

    /// Last batch of `url`, if its roster date is still accepted.
    pub fn batch_for(&self, url: &str, accepted: &[NaiveDate]) -> Option<SourceBatch> {
        let map = self.entries.lock().ok()?;
        let batch = map.get(url)?.batch.as_ref()?;
        batch
            .records
            .first()
            .is_some_and(|r| accepted.contains(&r.duty_date))
            .then(|| batch.clone())
    }

    pub fn remember(&self, url: &str, headers: ConditionalHeaders, batch: Option<&SourceBatch>) {
        if let Ok(mut map) = self.entries.lock() {
            let entry = map.entry(url.to_string()).or_default();
            entry.headers = headers;
            if let Some(b) = batch {
                entry.batch = Some(b.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One endpoint attempt, as reported back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub source_name: String,
    pub source_url: String,
    pub adapter: &'static str,
    pub status: RunStatus,
    pub http_status: Option<u16>,
    pub records: usize,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub fallback: bool,
}

/// Result of resolving one role.
#[derive(Debug, Clone, Serialize)]
pub struct RoleOutcome {
    pub role: SourceRole,
    /// At least one endpoint of this role is configured.
    pub configured: bool,
    #[serde(skip)]
    pub batch: Option<SourceBatch>,
    pub used_fallback: bool,
    pub attempts: Vec<AttemptReport>,
}

impl RoleOutcome {
    pub fn new(role: SourceRole, configured: bool) -> Self {
        Self {
            role,
            configured,
            batch: None,
            used_fallback: false,
            attempts: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.batch.is_some()
    }

    pub fn records(&self) -> usize {
        self.batch.as_ref().map(|b| b.records.len()).unwrap_or(0)
    }
}

/// Primary before secondary; inside a role, heavier sources first.
pub fn order_endpoints(endpoints: &mut [SourceEndpoint]) {
    endpoints.sort_by(|a, b| {
        a.role
            .cmp(&b.role)
            .then_with(|| b.authority_weight.cmp(&a.authority_weight))
    });
}

fn severity_for(role: SourceRole) -> Severity {
    match role {
        SourceRole::Primary => Severity::Critical,
        SourceRole::Secondary => Severity::Warning,
    }
}

pub struct SourceRepository {
    store: Arc<dyn IngestStore>,
    adapters: Arc<dyn AdapterResolver>,
    cache: Arc<ConditionalCache>,
    notify: Option<Arc<NotifyHub>>,
    cfg: OrchestratorConfig,
    weights: AuthorityWeights,
}

impl SourceRepository {
    pub fn new(
        store: Arc<dyn IngestStore>,
        adapters: Arc<dyn AdapterResolver>,
        cache: Arc<ConditionalCache>,
        cfg: OrchestratorConfig,
        weights: AuthorityWeights,
    ) -> Self {
        Self {
            store,
            adapters,
            cache,
            notify: None,
            cfg,
            weights,
        }
    }

    pub fn with_notify(mut self, hub: Arc<NotifyHub>) -> Self {
        self.notify = Some(hub);
        self
    }

    pub fn cache(&self) -> &Arc<ConditionalCache> {
        &self.cache
    }

    /// Endpoints of a province, loaded fresh: stored rows, else the built-in
    /// list. Ordered by role, then weight.
    pub async fn endpoints_for(&self, province_slug: &str) -> IngestResult<Vec<SourceEndpoint>> {
        let mut eps = self.store.endpoints_for(province_slug).await?;
        if eps.is_empty() {
            eps = builtin_endpoints_for(province_slug, &self.weights);
            if !eps.is_empty() {
                tracing::debug!(target: "ingest", province = %province_slug, endpoints = eps.len(), "using built-in endpoints");
            }
        }
        order_endpoints(&mut eps);
        Ok(eps)
    }

    /// Every province with stored or built-in endpoints.
    pub async fn provinces(&self) -> IngestResult<Vec<String>> {
        let mut slugs = self.store.provinces_with_endpoints().await?;
        slugs.extend(builtin_province_slugs(&self.weights));
        slugs.sort();
        slugs.dedup();
        Ok(slugs)
    }

    fn fallback_enabled(&self, role: SourceRole) -> bool {
        match role {
            SourceRole::Primary => self.cfg.fallback_primary,
            SourceRole::Secondary => self.cfg.fallback_secondary,
        }
    }

    /// Try the role's endpoints in order, stopping at the first success.
    pub async fn resolve_role(
        &self,
        province_slug: &str,
        role: SourceRole,
        endpoints: &[SourceEndpoint],
        ctx: &FetchContext,
    ) -> RoleOutcome {
        let candidates: Vec<&SourceEndpoint> = endpoints.iter().filter(|e| e.role == role).collect();
        let mut out = RoleOutcome::new(role, !candidates.is_empty());

        for ep in &candidates {
            let adapter = self.adapters.resolve(ep);
            let started_at = Utc::now();
            let result = self.attempt(adapter.as_ref(), ep, ctx).await;
            let finished_at = Utc::now();
            match result {
                Ok(outcome) => {
                    let status = if outcome.warnings.is_empty() {
                        RunStatus::Success
                    } else {
                        RunStatus::Partial
                    };
                    let report = self
                        .log_success(province_slug, ep, adapter.name(), status, &outcome, started_at, finished_at, false)
                        .await;
                    self.cache.remember(
                        &ep.url,
                        ConditionalHeaders {
                            etag: outcome.etag.clone(),
                            last_modified: outcome.last_modified.clone(),
                        },
                        outcome.batch.as_ref(),
                    );
                    out.attempts.push(report);
                    out.batch = outcome.batch;
                    self.check_threshold(province_slug, ep).await;
                    return out;
                }
                Err(e) => {
                    let report = self
                        .log_failure(province_slug, ep, adapter.name(), &e, started_at, finished_at, false)
                        .await;
                    out.attempts.push(report);
                    self.alert(
                        province_slug,
                        Some(ep),
                        AlertKind::AdapterFailed,
                        severity_for(role),
                        format!("{} ({}) failed: {e}", ep.source_name, role.as_str()),
                    )
                    .await;
                    self.check_threshold(province_slug, ep).await;
                }
            }
        }

        if let Some(template) = candidates.first().filter(|_| self.fallback_enabled(role)) {
            self.try_fallback(province_slug, template, ctx, &mut out).await;
        }
        if !out.succeeded() && out.configured {
            tracing::warn!(target: "ingest", province = %province_slug, role = role.as_str(), "role failed");
        }
        out
    }

    /// Fetch with remembered validators. A `304` reuses the cached batch of
    /// the same duty date; without one, the fetch is repeated unconditionally.
    async fn attempt(
        &self,
        adapter: &dyn SourceAdapter,
        ep: &SourceEndpoint,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome> {
        let conditional = self.cache.headers(&ep.url);
        let outcome = adapter.fetch(ep, &conditional, ctx).await?;
        if !outcome.not_modified() {
            return Ok(outcome);
        }
        if let Some(mut batch) = self.cache.batch_for(&ep.url, &ctx.accepted_dates) {
            let now = Utc::now();
            for r in &mut batch.records {
                r.fetched_at = now;
            }
            tracing::debug!(target: "ingest", endpoint = %ep.source_name, "not modified, cached batch reused");
            return Ok(FetchOutcome {
                batch: Some(batch),
                ..outcome
            });
        }

        tracing::info!(target: "ingest", endpoint = %ep.source_name, "304 without cached data, retrying unconditionally");
        let retry = adapter.fetch(ep, &ConditionalHeaders::default(), ctx).await?;
        if retry.batch.is_none() {
            return Err(IngestError::fetch(
                &ep.url,
                Some(retry.http_status),
                "not modified, and nothing cached",
            ));
        }
        Ok(retry)
    }

    async fn try_fallback(
        &self,
        province_slug: &str,
        template: &SourceEndpoint,
        ctx: &FetchContext,
        out: &mut RoleOutcome,
    ) {
        let fb = fallback_endpoint(template);
        let adapter = self.adapters.fallback();
        let started_at = Utc::now();
        let result = adapter.fetch(&fb, &ConditionalHeaders::default(), ctx).await;
        let finished_at = Utc::now();
        match result {
            Ok(outcome) if outcome.batch.is_some() => {
                let report = self
                    .log_success(province_slug, &fb, adapter.name(), RunStatus::Partial, &outcome, started_at, finished_at, true)
                    .await;
                out.attempts.push(report);
                out.batch = outcome.batch;
                out.used_fallback = true;
                self.alert(
                    province_slug,
                    Some(&fb),
                    AlertKind::FallbackUsed,
                    Severity::Warning,
                    format!("static fallback served the {} role", out.role.as_str()),
                )
                .await;
            }
            Ok(outcome) => {
                let e = IngestError::fetch(&fb.url, Some(outcome.http_status), "fallback returned no batch");
                self.fallback_failed(province_slug, &fb, adapter.name(), &e, started_at, finished_at, out)
                    .await;
            }
            Err(e) => {
                self.fallback_failed(province_slug, &fb, adapter.name(), &e, started_at, finished_at, out)
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fallback_failed(
        &self,
        province_slug: &str,
        fb: &SourceEndpoint,
        adapter: &'static str,
        e: &IngestError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        out: &mut RoleOutcome,
    ) {
        let report = self
            .log_failure(province_slug, fb, adapter, e, started_at, finished_at, true)
            .await;
        out.attempts.push(report);
        self.alert(
            province_slug,
            Some(fb),
            AlertKind::FallbackFailed,
            Severity::Critical,
            format!("static fallback for the {} role failed: {e}", out.role.as_str()),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_success(
        &self,
        province_slug: &str,
        ep: &SourceEndpoint,
        adapter: &'static str,
        status: RunStatus,
        outcome: &FetchOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        fallback: bool,
    ) -> AttemptReport {
        let records = outcome.batch.as_ref().map(|b| b.records.len()).unwrap_or(0);
        let run = RunRecord {
            province_slug: province_slug.to_string(),
            endpoint_id: (ep.id > 0).then_some(ep.id),
            source_name: ep.source_name.clone(),
            source_url: ep.url.clone(),
            role: ep.role,
            adapter: adapter.to_string(),
            status,
            http_status: Some(outcome.http_status),
            error_kind: None,
            error_message: (!outcome.warnings.is_empty()).then(|| outcome.warnings.join("; ")),
            records,
            payload_sha256: (!outcome.raw_payload.is_empty()).then(|| payload_digest(&outcome.raw_payload)),
            etag: outcome.etag.clone(),
            last_modified: outcome.last_modified.clone(),
            started_at,
            finished_at,
        };
        self.record_run(&run).await;
        tracing::info!(
            target: "ingest",
            province = %province_slug,
            endpoint = %ep.source_name,
            role = ep.role.as_str(),
            status = status.as_str(),
            http_status = outcome.http_status,
            rows = records,
            "endpoint attempt succeeded"
        );
        AttemptReport {
            source_name: ep.source_name.clone(),
            source_url: ep.url.clone(),
            adapter,
            status,
            http_status: Some(outcome.http_status),
            records,
            error: None,
            warnings: outcome.warnings.clone(),
            fallback,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_failure(
        &self,
        province_slug: &str,
        ep: &SourceEndpoint,
        adapter: &'static str,
        e: &IngestError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        fallback: bool,
    ) -> AttemptReport {
        let run = RunRecord {
            province_slug: province_slug.to_string(),
            endpoint_id: (ep.id > 0).then_some(ep.id),
            source_name: ep.source_name.clone(),
            source_url: ep.url.clone(),
            role: ep.role,
            adapter: adapter.to_string(),
            status: RunStatus::Failed,
            http_status: e.http_status(),
            error_kind: Some(e.kind().to_string()),
            error_message: Some(e.to_string()),
            records: 0,
            payload_sha256: e.payload_sha256().map(str::to_string),
            etag: None,
            last_modified: None,
            started_at,
            finished_at,
        };
        self.record_run(&run).await;
        tracing::warn!(
            target: "ingest",
            province = %province_slug,
            endpoint = %ep.source_name,
            role = ep.role.as_str(),
            kind = e.kind(),
            error = %e,
            "endpoint attempt failed"
        );
        AttemptReport {
            source_name: ep.source_name.clone(),
            source_url: ep.url.clone(),
            adapter,
            status: RunStatus::Failed,
            http_status: e.http_status(),
            records: 0,
            error: Some(e.to_string()),
            warnings: Vec::new(),
            fallback,
        }
    }

    async fn record_run(&self, run: &RunRecord) {
        counter!("ingest_runs_total", "status" => run.status.as_str()).increment(1);
        if let Err(e) = self.store.record_run(run).await {
            tracing::warn!(target: "ingest", source_url = %run.source_url, error = %e, "run not recorded");
        }
    }

    /// Persist an alert and fan critical ones out to the notifiers.
    pub async fn alert(
        &self,
        province_slug: &str,
        ep: Option<&SourceEndpoint>,
        kind: AlertKind,
        severity: Severity,
        message: String,
    ) {
        let alert = AlertRecord {
            province_slug: province_slug.to_string(),
            endpoint_id: ep.and_then(|e| (e.id > 0).then_some(e.id)),
            source_url: ep.map(|e| e.url.clone()),
            kind,
            severity,
            message,
            created_at: Utc::now(),
        };
        counter!("ingest_alerts_total", "kind" => kind.as_str()).increment(1);
        if let Err(e) = self.store.raise_alert(&alert).await {
            tracing::warn!(target: "ingest", kind = kind.as_str(), error = %e, "alert not recorded");
        }
        if let Some(hub) = &self.notify {
            hub.dispatch(&AlertEvent::from(&alert)).await;
        }
    }

    /// Raise `parser_error_threshold` when the endpoint's recent failure
    /// rate is too high, at most once per dedup window.
    async fn check_threshold(&self, province_slug: &str, ep: &SourceEndpoint) {
        let now = Utc::now();
        let since = now - Duration::hours(self.cfg.threshold_window_hours.max(1));
        let stats = match self.store.run_stats_since(&ep.url, since).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "ingest", endpoint = %ep.source_name, error = %e, "run stats unavailable");
                return;
            }
        };
        if stats.total < self.cfg.threshold_min_runs || stats.failure_pct() < self.cfg.threshold_failure_pct {
            return;
        }
        let dedup_since = now - Duration::minutes(self.cfg.alert_dedup_minutes.max(0));
        match self
            .store
            .alert_exists_since(&ep.url, AlertKind::ParserErrorThreshold, dedup_since)
            .await
        {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                tracing::warn!(target: "ingest", endpoint = %ep.source_name, error = %e, "alert dedup check failed");
                return;
            }
        }
        self.alert(
            province_slug,
            Some(ep),
            AlertKind::ParserErrorThreshold,
            severity_for(ep.role),
            format!(
                "{}: {}/{} runs failed in the last {}h ({:.0}%)",
                ep.source_name,
                stats.failed,
                stats.total,
                self.cfg.threshold_window_hours,
                stats.failure_pct()
            ),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{AdapterSpec, PayloadFormat};

    fn ep(name: &str, role: SourceRole, weight: u8) -> SourceEndpoint {
        SourceEndpoint {
            id: 0,
            province_slug: "istanbul".into(),
            source_name: name.into(),
            source_type: String::new(),
            authority_weight: weight,
            url: format!("https://example.org/{name}"),
            format: PayloadFormat::Auto,
            parser_key: None,
            role,
            adapter: AdapterSpec::Generic,
            strict_date: false,
            date_selectors: vec![],
        }
    }

    #[test]
    fn endpoints_order_by_role_then_weight() {
        let mut eps = vec![
            ep("s", SourceRole::Secondary, 90),
            ep("p-low", SourceRole::Primary, 50),
            ep("p-high", SourceRole::Primary, 80),
        ];
        order_endpoints(&mut eps);
        let names: Vec<_> = eps.iter().map(|e| e.source_name.as_str()).collect();
        assert_eq!(names, vec!["p-high", "p-low", "s"]);
    }

    #[test]
    fn cache_keeps_headers_and_batch_by_url() {
        let cache = ConditionalCache::new();
        assert!(cache.headers("u").is_empty());
        cache.seed(vec![(
            "u".into(),
            ConditionalHeaders {
                etag: Some("\"v1\"".into()),
                last_modified: None,
            },
        )]);
        assert_eq!(cache.headers("u").etag.as_deref(), Some("\"v1\""));
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(cache.batch_for("u", &[date]).is_none());
        assert_eq!(cache.len(), 1);
    }
}
