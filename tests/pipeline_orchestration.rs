// tests/pipeline_orchestration.rs
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use pharmacy_duty_ingest::config::OrchestratorConfig;
use pharmacy_duty_ingest::duty_window::active_duty_date;
use pharmacy_duty_ingest::error::{IngestError, IngestResult};
use pharmacy_duty_ingest::ingest::{build_batch, payload_digest};
use pharmacy_duty_ingest::ingest::providers::{AdapterResolver, StaticSeedAdapter};
use pharmacy_duty_ingest::ingest::repository::{ConditionalCache, SourceRepository};
use pharmacy_duty_ingest::ingest::types::{
    AdapterSpec, ConditionalHeaders, FetchContext, FetchOutcome, PayloadFormat, SourceAdapter, SourceEndpoint,
    SourceRole,
};
use pharmacy_duty_ingest::parse::ParsedRow;
use pharmacy_duty_ingest::source_weights::AuthorityWeights;
use pharmacy_duty_ingest::store::IngestStore;
use pharmacy_duty_ingest::{Pipeline, SqliteStore};

const PRIMARY: &str = "https://oda.example/nobet";
const SECONDARY: &str = "https://portal.example/nobet";

#[derive(Clone)]
enum Step {
    Rows(Vec<ParsedRow>),
    /// `304` when validators are sent, rows otherwise.
    Conditional(Vec<ParsedRow>),
    Fail(u16),
    /// Fetched fine, nothing usable in the body.
    Unparsable(String),
    Slow(u64, Vec<ParsedRow>),
}

/// Plays back a per-URL script; the last step repeats.
#[derive(Default)]
struct Scripted {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, ConditionalHeaders)>>,
}

impl Scripted {
    fn script(&self, url: &str, steps: Vec<Step>) {
        self.steps.lock().unwrap().insert(url.to_string(), steps.into());
    }

    fn calls_to(&self, url: &str) -> Vec<ConditionalHeaders> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn next(&self, url: &str) -> Option<Step> {
        let mut steps = self.steps.lock().unwrap();
        let q = steps.get_mut(url)?;
        if q.len() > 1 {
            q.pop_front()
        } else {
            q.front().cloned()
        }
    }
}

fn outcome(ep: &SourceEndpoint, rows: Vec<ParsedRow>, ctx: &FetchContext) -> FetchOutcome {
    FetchOutcome {
        batch: Some(build_batch(ep, rows, ctx, Utc::now())),
        http_status: 200,
        etag: Some("\"v1\"".into()),
        last_modified: None,
        raw_payload: format!("payload of {}", ep.url),
        warnings: Vec::new(),
    }
}

#[async_trait]
impl SourceAdapter for Scripted {
    async fn fetch(
        &self,
        ep: &SourceEndpoint,
        conditional: &ConditionalHeaders,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((ep.url.clone(), conditional.clone()));
        match self.next(&ep.url) {
            Some(Step::Rows(rows)) => Ok(outcome(ep, rows, ctx)),
            Some(Step::Conditional(rows)) => {
                if conditional.etag.is_some() {
                    Ok(FetchOutcome {
                        batch: None,
                        http_status: 304,
                        etag: conditional.etag.clone(),
                        last_modified: None,
                        raw_payload: String::new(),
                        warnings: Vec::new(),
                    })
                } else {
                    Ok(outcome(ep, rows, ctx))
                }
            }
            Some(Step::Fail(status)) => Err(IngestError::fetch(&ep.url, Some(status), format!("HTTP {status}"))),
            Some(Step::Unparsable(body)) => Err(IngestError::parse(&ep.source_name).with_payload(&body)),
            Some(Step::Slow(ms, rows)) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(outcome(ep, rows, ctx))
            }
            None => Err(IngestError::fetch(&ep.url, None, "no script")),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedResolver(Arc<Scripted>);

impl AdapterResolver for ScriptedResolver {
    fn resolve(&self, _endpoint: &SourceEndpoint) -> Arc<dyn SourceAdapter> {
        self.0.clone()
    }

    fn fallback(&self) -> Arc<dyn SourceAdapter> {
        Arc::new(StaticSeedAdapter)
    }
}

fn row(district: &str, name: &str, address: &str, phone: &str) -> ParsedRow {
    ParsedRow {
        district_name: district.into(),
        pharmacy_name: name.into(),
        address: address.into(),
        phone: phone.into(),
        lat: None,
        lng: None,
    }
}

fn aa() -> ParsedRow {
    row("Kadıköy", "AA ECZANESİ", "Moda Cd. No:5", "02161112233")
}
fn bb() -> ParsedRow {
    row("Üsküdar", "BB ECZANESİ", "Hakimiyeti Milliye Cd. 3", "02161112234")
}
fn cc() -> ParsedRow {
    row("Beşiktaş", "CC ECZANESİ", "Barbaros Blv. 10", "02122223344")
}

fn endpoint(province: &str, url: &str, role: SourceRole, weight: u8) -> SourceEndpoint {
    SourceEndpoint {
        id: 0,
        province_slug: province.into(),
        source_name: format!("{} {}", role.as_str(), url),
        source_type: String::new(),
        authority_weight: weight,
        url: url.into(),
        format: PayloadFormat::Html,
        parser_key: None,
        role,
        adapter: AdapterSpec::Generic,
        strict_date: false,
        date_selectors: vec![],
    }
}

struct Harness {
    store: SqliteStore,
    script: Arc<Scripted>,
    cfg: OrchestratorConfig,
}

impl Harness {
    async fn new(province: &str, with_secondary: bool, cfg: OrchestratorConfig) -> Self {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut eps = vec![endpoint(province, PRIMARY, SourceRole::Primary, 80)];
        if with_secondary {
            eps.push(endpoint(province, SECONDARY, SourceRole::Secondary, 50));
        }
        store.seed_endpoints(&eps).await.unwrap();
        Self {
            store,
            script: Arc::new(Scripted::default()),
            cfg,
        }
    }

    fn pipeline_with(&self, cache: Arc<ConditionalCache>, budget: Duration) -> Pipeline {
        let store: Arc<dyn IngestStore> = Arc::new(self.store.clone());
        let repo = SourceRepository::new(
            store.clone(),
            Arc::new(ScriptedResolver(self.script.clone())),
            cache,
            self.cfg.clone(),
            AuthorityWeights::default(),
        );
        Pipeline::new(Arc::new(repo), store, budget)
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with(Arc::new(ConditionalCache::new()), Duration::from_secs(10))
    }

    async fn alert_kinds(&self, province: &str) -> Vec<String> {
        self.store
            .alerts_for(province)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect()
    }
}

#[tokio::test]
async fn corroborated_and_primary_only_records_are_persisted() {
    let h = Harness::new("istanbul", true, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Rows(vec![aa(), bb()])]);
    h.script.script(SECONDARY, vec![Step::Rows(vec![aa(), cc()])]);

    let report = h.pipeline().pull_province("istanbul").await.unwrap();
    assert_eq!(report.records, 2);
    assert_eq!(report.corroborated, 1);
    assert_eq!(report.degraded, 1);
    assert_eq!(report.conflicts, 0);

    let rows = h.store.duty_rows("istanbul", report.duty_date).await.unwrap();
    let by_name: HashMap<_, _> = rows.iter().map(|r| (r.normalized_name.as_str(), r)).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(by_name["AA"].verification_source_count, 2);
    assert!(!by_name["AA"].is_degraded);
    assert!(by_name["BB"].is_degraded);
    assert!(by_name["AA"].confidence > by_name["BB"].confidence);
    // Unmatched secondary rows are not persisted while a primary batch exists.
    assert!(!by_name.contains_key("CC"));
    assert_eq!(h.store.table_count("duty_evidence").await.unwrap(), 3);

    let runs = h.store.runs_for("istanbul").await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == "success" && r.payload_sha256.is_some()));
}

#[tokio::test]
async fn repeated_pull_is_idempotent() {
    let h = Harness::new("istanbul", true, OrchestratorConfig::default()).await;
    let mut moved = aa();
    moved.phone = "02169998877".into();
    h.script.script(PRIMARY, vec![Step::Rows(vec![aa(), bb()])]);
    h.script.script(SECONDARY, vec![Step::Rows(vec![moved])]);

    let pipeline = h.pipeline();
    let first = pipeline.pull_province("istanbul").await.unwrap();
    assert_eq!(first.persisted.conflicts_new, 1);

    let second = pipeline.pull_province("istanbul").await.unwrap();
    assert_eq!(second.persisted.records_upserted, 2);
    assert_eq!(second.persisted.conflicts_new, 0);
    assert_eq!(second.persisted.conflicts_seen, 1);
    assert_eq!(second.persisted.expired, 0);

    assert_eq!(h.store.table_count("duty_records").await.unwrap(), 2);
    assert_eq!(h.store.table_count("pharmacies").await.unwrap(), 2);
    assert_eq!(h.store.table_count("duty_evidence").await.unwrap(), 3);
    assert_eq!(h.store.table_count("duty_conflicts").await.unwrap(), 1);
}

#[tokio::test]
async fn delisted_record_expires_and_comes_back() {
    let h = Harness::new("istanbul", false, OrchestratorConfig::default()).await;
    h.script.script(
        PRIMARY,
        vec![
            Step::Rows(vec![aa(), bb()]),
            Step::Rows(vec![aa()]),
            Step::Rows(vec![aa(), bb()]),
        ],
    );
    let pipeline = h.pipeline();

    pipeline.pull_province("istanbul").await.unwrap();
    assert_eq!(h.store.active_duty_rows("istanbul", Utc::now()).await.unwrap().len(), 2);

    let second = pipeline.pull_province("istanbul").await.unwrap();
    assert_eq!(second.persisted.expired, 1);
    let active = h.store.active_duty_rows("istanbul", Utc::now()).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].normalized_name, "AA");
    // Expired rows stay on file.
    assert_eq!(h.store.table_count("duty_records").await.unwrap(), 2);

    pipeline.pull_province("istanbul").await.unwrap();
    assert_eq!(h.store.active_duty_rows("istanbul", Utc::now()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn secondary_alone_yields_degraded_records() {
    let h = Harness::new("istanbul", true, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Fail(500)]);
    h.script.script(SECONDARY, vec![Step::Rows(vec![aa(), cc()])]);

    let report = h.pipeline().pull_province("istanbul").await.unwrap();
    assert!(!report.primary.succeeded());
    assert_eq!(report.records, 2);
    assert_eq!(report.degraded, 2);

    let alerts = h.store.alerts_for("istanbul").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, "adapter_failed");
    assert_eq!(alerts[0].severity, "critical");
    assert_eq!(alerts[0].source_url.as_deref(), Some(PRIMARY));

    let runs = h.store.runs_for("istanbul").await.unwrap();
    let failed = runs.iter().find(|r| r.source_url == PRIMARY).unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.http_status, Some(500));
    assert_eq!(failed.error_kind.as_deref(), Some("fetch"));
}

#[tokio::test]
async fn failed_parse_run_keeps_payload_digest() {
    let h = Harness::new("istanbul", true, OrchestratorConfig::default()).await;
    let body = "<html><body><p>Bakımdayız</p></body></html>";
    h.script.script(PRIMARY, vec![Step::Unparsable(body.to_string())]);
    h.script.script(SECONDARY, vec![Step::Rows(vec![aa()])]);

    h.pipeline().pull_province("istanbul").await.unwrap();

    let runs = h.store.runs_for("istanbul").await.unwrap();
    let failed = runs.iter().find(|r| r.source_url == PRIMARY).unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.error_kind.as_deref(), Some("parse"));
    assert_eq!(failed.payload_sha256.as_deref(), Some(payload_digest(body).as_str()));
}

#[tokio::test]
async fn both_roles_failing_is_no_records() {
    let h = Harness::new("istanbul", true, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Fail(500)]);
    h.script.script(SECONDARY, vec![Step::Fail(502)]);

    let err = h.pipeline().pull_province("istanbul").await.unwrap_err();
    assert!(matches!(err, IngestError::NoRecords(_)));
    assert!(err.is_retryable());
    assert_eq!(h.store.table_count("duty_records").await.unwrap(), 0);

    let alerts = h.store.alerts_for("istanbul").await.unwrap();
    let severities: Vec<_> = alerts.iter().map(|a| a.severity.as_str()).collect();
    assert_eq!(severities, vec!["critical", "warning"]);
}

#[tokio::test]
async fn province_without_endpoints_raises_and_is_not_retryable() {
    let h = Harness::new("istanbul", false, OrchestratorConfig::default()).await;
    let err = h.pipeline().pull_province("rize").await.unwrap_err();
    assert!(matches!(err, IngestError::NoEndpoint(_)));
    assert!(!err.is_retryable());
    assert_eq!(h.alert_kinds("rize").await, vec!["no_active_endpoints"]);
}

#[tokio::test]
async fn static_fallback_serves_failed_primary() {
    let cfg = OrchestratorConfig {
        fallback_primary: true,
        ..OrchestratorConfig::default()
    };
    let h = Harness::new("istanbul", false, cfg).await;
    h.script.script(PRIMARY, vec![Step::Fail(503)]);

    let report = h.pipeline().pull_province("istanbul").await.unwrap();
    assert!(report.primary.used_fallback);
    assert!(report.records > 0);
    assert_eq!(report.degraded, 0);

    assert_eq!(h.alert_kinds("istanbul").await, vec!["adapter_failed", "fallback_used"]);
    let runs = h.store.runs_for("istanbul").await.unwrap();
    let fb = runs.iter().find(|r| r.source_url.starts_with("static://")).unwrap();
    assert_eq!(fb.status, "partial");
}

#[tokio::test]
async fn missing_static_seed_raises_fallback_failed() {
    let cfg = OrchestratorConfig {
        fallback_primary: true,
        ..OrchestratorConfig::default()
    };
    let h = Harness::new("bursa", false, cfg).await;
    h.script.script(PRIMARY, vec![Step::Fail(503)]);

    let err = h.pipeline().pull_province("bursa").await.unwrap_err();
    assert!(matches!(err, IngestError::NoRecords(_)));
    let alerts = h.store.alerts_for("bursa").await.unwrap();
    let last = alerts.last().unwrap();
    assert_eq!(last.kind, "fallback_failed");
    assert_eq!(last.severity, "critical");
}

#[tokio::test]
async fn failure_threshold_alert_is_deduplicated() {
    let cfg = OrchestratorConfig {
        threshold_min_runs: 3,
        threshold_failure_pct: 50.0,
        ..OrchestratorConfig::default()
    };
    let h = Harness::new("istanbul", true, cfg).await;
    h.script.script(PRIMARY, vec![Step::Fail(500)]);
    h.script.script(SECONDARY, vec![Step::Rows(vec![aa()])]);

    let pipeline = h.pipeline();
    for _ in 0..5 {
        pipeline.pull_province("istanbul").await.unwrap();
    }

    let kinds = h.alert_kinds("istanbul").await;
    assert_eq!(kinds.iter().filter(|k| *k == "adapter_failed").count(), 5);
    assert_eq!(kinds.iter().filter(|k| *k == "parser_error_threshold").count(), 1);
}

#[tokio::test]
async fn not_modified_reuses_cached_batch() {
    let h = Harness::new("istanbul", false, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Conditional(vec![aa(), bb()])]);

    let pipeline = h.pipeline();
    pipeline.pull_province("istanbul").await.unwrap();
    let second = pipeline.pull_province("istanbul").await.unwrap();
    assert_eq!(second.records, 2);
    assert_eq!(second.persisted.expired, 0);

    let calls = h.script.calls_to(PRIMARY);
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_empty());
    assert_eq!(calls[1].etag.as_deref(), Some("\"v1\""));

    let runs = h.store.runs_for("istanbul").await.unwrap();
    assert_eq!(runs[1].http_status, Some(304));
    assert_eq!(runs[1].records, 2);
}

#[tokio::test]
async fn not_modified_without_cached_batch_refetches() {
    let h = Harness::new("istanbul", false, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Conditional(vec![aa(), bb()])]);
    h.pipeline().pull_province("istanbul").await.unwrap();

    // A restarted process only has the validators from the run log.
    let cache = Arc::new(ConditionalCache::new());
    cache.seed(h.store.latest_validators().await.unwrap());
    assert_eq!(cache.headers(PRIMARY).etag.as_deref(), Some("\"v1\""));

    let report = h
        .pipeline_with(cache, Duration::from_secs(10))
        .pull_province("istanbul")
        .await
        .unwrap();
    assert_eq!(report.records, 2);

    let calls = h.script.calls_to(PRIMARY);
    assert_eq!(calls.len(), 3);
    assert!(calls[1].etag.is_some());
    assert!(calls[2].is_empty());
}

#[tokio::test]
async fn budget_overrun_cancels_without_writing() {
    let h = Harness::new("istanbul", false, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Slow(2_000, vec![aa()])]);

    let pipeline = h.pipeline_with(Arc::new(ConditionalCache::new()), Duration::from_millis(200));
    let err = pipeline.pull_province("istanbul").await.unwrap_err();
    assert!(matches!(err, IngestError::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(h.store.table_count("duty_records").await.unwrap(), 0);
}

#[tokio::test]
async fn full_sync_covers_stored_and_builtin_provinces() {
    let h = Harness::new("rize", false, OrchestratorConfig::default()).await;
    let provinces = h.pipeline().provinces_with_endpoints().await.unwrap();
    assert!(provinces.contains(&"rize".to_string()));
    assert!(provinces.contains(&"istanbul".to_string()));
    let mut sorted = provinces.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, provinces);
}

#[tokio::test]
async fn duty_window_is_stored_with_each_record() {
    let h = Harness::new("istanbul", false, OrchestratorConfig::default()).await;
    h.script.script(PRIMARY, vec![Step::Rows(vec![aa()])]);
    h.pipeline().pull_province("istanbul").await.unwrap();

    let date = active_duty_date(Utc::now());
    let rows = h.store.duty_rows("istanbul", date).await.unwrap();
    assert_eq!(rows.len(), 1);
    // 08:00 Istanbul is 05:00 UTC.
    assert!(rows[0].duty_start.ends_with("T05:00:00Z"));
    assert!(rows[0].duty_end > rows[0].duty_start);
}
