// tests/adapters_http.rs
use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pharmacy_duty_ingest::config::FetchConfig;
use pharmacy_duty_ingest::duty_window::active_duty_date;
use pharmacy_duty_ingest::error::IngestError;
use pharmacy_duty_ingest::ingest::providers::{
    DistrictFormAdapter, GenericAdapter, HttpClient, SessionTokenAdapter,
};
use pharmacy_duty_ingest::ingest::types::{
    AdapterSpec, ConditionalHeaders, FetchContext, PayloadFormat, SourceAdapter, SourceEndpoint, SourceRole,
};

fn today_label() -> String {
    active_duty_date(Utc::now()).format("%d.%m.%Y").to_string()
}

fn roster_page() -> String {
    format!(
        r#"<html><body>
        <h2>Nöbet Tarihi: {}</h2>
        <table>
          <tr><th>İlçe</th><th>Eczane Adı</th><th>Adres</th><th>Telefon</th></tr>
          <tr><td>Kadıköy</td><td>AA ECZANESİ</td><td>Moda Cd. No:5</td><td>0216 111 22 33</td></tr>
          <tr><td>Üsküdar</td><td>BB ECZANESİ</td><td>Hakimiyeti Milliye Cd. 3</td><td>0216 111 22 34</td></tr>
        </table></body></html>"#,
        today_label()
    )
}

fn endpoint(url: String, adapter: AdapterSpec) -> SourceEndpoint {
    SourceEndpoint {
        id: 0,
        province_slug: "istanbul".into(),
        source_name: "Test Eczacı Odası".into(),
        source_type: "chamber".into(),
        authority_weight: 80,
        url,
        format: PayloadFormat::Auto,
        parser_key: None,
        role: SourceRole::Primary,
        adapter,
        strict_date: false,
        date_selectors: vec![],
    }
}

fn http() -> HttpClient {
    HttpClient::new(&FetchConfig::default())
}

fn ctx() -> FetchContext {
    FetchContext::at(Utc::now(), vec![])
}

#[tokio::test]
async fn generic_get_parses_table_and_keeps_validators() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nobet"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_string(roster_page()),
        )
        .mount(&server)
        .await;

    let ep = endpoint(format!("{}/nobet", server.uri()), AdapterSpec::Generic);
    let out = GenericAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap();

    assert_eq!(out.http_status, 200);
    assert_eq!(out.etag.as_deref(), Some("\"v1\""));
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    let batch = out.batch.unwrap();
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[0].district_slug, "kadikoy");
    assert_eq!(batch.records[0].phone, "02161112233");
    assert_eq!(batch.records[0].duty_date, active_duty_date(Utc::now()));
    assert_eq!(batch.meta.endpoint_id, None);
}

#[tokio::test]
async fn generic_not_modified_returns_no_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nobet"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let ep = endpoint(format!("{}/nobet", server.uri()), AdapterSpec::Generic);
    let conditional = ConditionalHeaders {
        etag: Some("\"v1\"".into()),
        last_modified: None,
    };
    let out = GenericAdapter::new(http()).fetch(&ep, &conditional, &ctx()).await.unwrap();
    assert!(out.not_modified());
    assert!(out.batch.is_none());
    assert_eq!(out.etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn generic_server_error_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let ep = endpoint(format!("{}/nobet", server.uri()), AdapterSpec::Generic);
    let err = GenericAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Fetch { status: Some(503), .. }));
}

#[tokio::test]
async fn empty_landing_page_falls_back_to_discovered_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a href="/hakkimizda">Hakkımızda</a>
               <a href="/nobetci-eczaneler">Nöbetçi Eczaneler</a></body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nobetci-eczaneler"))
        .respond_with(ResponseTemplate::new(200).set_body_string(roster_page()))
        .mount(&server)
        .await;

    let ep = endpoint(format!("{}/", server.uri()), AdapterSpec::Generic);
    let out = GenericAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap();
    assert_eq!(out.batch.unwrap().records.len(), 2);
    assert!(out.warnings.iter().any(|w| w.contains("/nobetci-eczaneler")));
}

#[tokio::test]
async fn page_without_rows_or_links_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body><p>Bakımdayız</p></body></html>"))
        .mount(&server)
        .await;

    let ep = endpoint(format!("{}/", server.uri()), AdapterSpec::Generic);
    let err = GenericAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Parse { .. }));
    // The rejected page stays traceable.
    assert_eq!(err.payload_sha256().map(str::len), Some(64));
}

#[tokio::test]
async fn stale_roster_fails_strict_and_warns_lenient() {
    let stale = (active_duty_date(Utc::now()) - Duration::days(5)).format("%d.%m.%Y").to_string();
    let body = roster_page().replace(&today_label(), &stale);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut ep = endpoint(format!("{}/nobet", server.uri()), AdapterSpec::Generic);
    let adapter = GenericAdapter::new(http());

    let lenient = adapter.fetch(&ep, &ConditionalHeaders::default(), &ctx()).await.unwrap();
    assert_eq!(lenient.batch.unwrap().records.len(), 2);
    assert!(lenient.warnings.iter().any(|w| w.contains("outside the accepted window")));

    ep.strict_date = true;
    let err = adapter
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::StaleDate { .. }));
    assert!(err.payload_sha256().is_some());
}

const UNDATED_JSON: &str = r#"{"data":[
    {"eczane":"CC ECZANESİ","ilce":"Kadıköy","adres":"Bahariye Cd. 1","telefon":"0216 222 33 44"},
    {"eczane":"DD ECZANESİ","ilce":"Üsküdar","adres":"Çengelköy 2","telefon":"0216 222 33 45"}
]}"#;

#[tokio::test]
async fn undated_json_warns_lenient_and_fails_strict() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(UNDATED_JSON))
        .mount(&server)
        .await;

    let mut ep = endpoint(format!("{}/api", server.uri()), AdapterSpec::Generic);
    let adapter = GenericAdapter::new(http());

    let out = adapter.fetch(&ep, &ConditionalHeaders::default(), &ctx()).await.unwrap();
    assert!(out.warnings.iter().any(|w| w.contains("no roster date")), "{:?}", out.warnings);
    assert_eq!(out.batch.unwrap().records.len(), 2);

    ep.strict_date = true;
    let err = adapter
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::StaleDate { found: None, .. }));
}

/// 07:30 in Istanbul on 18 Oct 2026: the 17th is still on duty, the 18th
/// roster may already be published.
fn before_rollover() -> FetchContext {
    FetchContext::at(Utc.with_ymd_and_hms(2026, 10, 18, 4, 30, 0).unwrap(), vec![])
}

fn oct(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
}

#[tokio::test]
async fn early_page_for_the_coming_day_keeps_its_own_date() {
    let body = roster_page().replace(&today_label(), "18.10.2026");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut ep = endpoint(format!("{}/nobet", server.uri()), AdapterSpec::Generic);
    ep.strict_date = true;
    let ctx = before_rollover();
    assert_eq!(ctx.duty_date, oct(17));

    let out = GenericAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx)
        .await
        .unwrap();
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    let batch = out.batch.unwrap();
    assert_eq!(batch.records.len(), 2);
    assert!(batch.records.iter().all(|r| r.duty_date == oct(18)));
}

#[tokio::test]
async fn early_json_keeps_only_the_newest_accepted_roster() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"data":[
                {"eczane":"AA ECZANESİ","ilce":"Kadıköy","telefon":"0216 111 22 33","tarih":"17.10.2026"},
                {"eczane":"CC ECZANESİ","ilce":"Kadıköy","telefon":"0216 222 33 44","tarih":"18.10.2026"},
                {"eczane":"DD ECZANESİ","ilce":"Üsküdar","telefon":"0216 222 33 45","tarih":"18.10.2026"}
            ]}"#,
        ))
        .mount(&server)
        .await;

    let mut ep = endpoint(format!("{}/api", server.uri()), AdapterSpec::Generic);
    ep.strict_date = true;
    let out = GenericAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &before_rollover())
        .await
        .unwrap();
    let batch = out.batch.unwrap();
    let names: Vec<_> = batch.records.iter().map(|r| r.normalized_name.as_str()).collect();
    assert_eq!(names, vec!["CC", "DD"]);
    assert!(batch.records.iter().all(|r| r.duty_date == oct(18)));
}

#[tokio::test]
async fn session_token_is_lifted_and_posted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nobet"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><body><h1>Nöbetçi Eczaneler {}</h1>
               <form><input type="hidden" name="h" value="tok12345"></form></body></html>"#,
            today_label()
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ajax"))
        .and(header("X-Requested-With", "XMLHttpRequest"))
        .and(body_string_contains("h=tok12345"))
        .and(body_string_contains("jx=1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<table>
                <tr><th>Eczane Adı</th><th>Adres</th><th>Telefon</th><th>İlçe</th></tr>
                <tr><td>AA ECZANESİ</td><td>Moda Cd. No:5</td><td>0216 111 22 33</td><td>Kadıköy</td></tr>
                <tr><td>BB ECZANESİ</td><td>Hakimiyeti Milliye Cd. 3</td><td>0216 111 22 34</td><td>Üsküdar</td></tr>
            </table>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let mut form = BTreeMap::new();
    form.insert("jx".to_string(), "1".to_string());
    let ep = endpoint(
        format!("{}/nobet", server.uri()),
        AdapterSpec::SessionToken {
            ajax_url: format!("{}/ajax", server.uri()),
            token_field: "h".into(),
            form,
        },
    );
    let out = SessionTokenAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap();
    // The fragment has no date; the landing page's heading is used.
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
    let batch = out.batch.unwrap();
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.records[1].district_slug, "uskudar");
}

#[tokio::test]
async fn missing_session_token_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>no form</body></html>"))
        .mount(&server)
        .await;

    let ep = endpoint(
        format!("{}/nobet", server.uri()),
        AdapterSpec::SessionToken {
            ajax_url: format!("{}/ajax", server.uri()),
            token_field: "h".into(),
            form: BTreeMap::new(),
        },
    );
    let err = SessionTokenAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Fetch { .. }));
}

fn district_row(name: &str, phone: &str) -> String {
    format!(
        r#"<table>
            <tr><th>Eczane Adı</th><th>Adres</th><th>Telefon</th></tr>
            <tr><td>{name}</td><td>Merkez Mah. 1. Sk. No:3</td><td>{phone}</td></tr>
        </table>"#
    )
}

#[tokio::test]
async fn district_form_posts_each_option_and_merges() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nobet"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><body><h1>Nöbet Tarihi {}</h1>
               <form method="post"><select name="ilce">
                 <option value="0">Seçiniz</option>
                 <option value="1">Kadıköy</option>
                 <option value="2">Üsküdar</option>
                 <option value="3">Beşiktaş</option>
               </select></form></body></html>"#,
            today_label()
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/liste"))
        .and(body_string_contains("ilce=1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(district_row("AA ECZANESİ", "0216 111 22 33")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/liste"))
        .and(body_string_contains("ilce=2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(district_row("BB ECZANESİ", "0216 111 22 34")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/liste"))
        .and(body_string_contains("ilce=3"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ep = endpoint(
        format!("{}/nobet", server.uri()),
        AdapterSpec::DistrictForm {
            select_name: "ilce".into(),
            post_url: Some(format!("{}/liste", server.uri())),
            form: BTreeMap::new(),
        },
    );
    let out = DistrictFormAdapter::new(http())
        .fetch(&ep, &ConditionalHeaders::default(), &ctx())
        .await
        .unwrap();

    let batch = out.batch.unwrap();
    let slugs: Vec<_> = batch.records.iter().map(|r| r.district_slug.as_str()).collect();
    assert_eq!(slugs, vec!["kadikoy", "uskudar"]);
    assert_eq!(out.warnings.len(), 1);
    assert!(out.warnings[0].contains("Beşiktaş"));
}
