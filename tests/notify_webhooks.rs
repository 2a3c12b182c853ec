// tests/notify_webhooks.rs
use std::sync::Arc;

use chrono::Utc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pharmacy_duty_ingest::notify::{AlertEvent, DiscordNotifier, Notifier, NotifyHub, SlackNotifier};
use pharmacy_duty_ingest::store::{AlertKind, Severity};

fn critical(province: &str, kind: AlertKind) -> AlertEvent {
    AlertEvent {
        province_slug: province.into(),
        kind,
        severity: Severity::Critical,
        message: "İstanbul Eczacı Odası (primary) failed: HTTP 503".into(),
        source_url: Some("https://oda.example/nobet".into()),
        ts: Utc::now(),
    }
}

#[tokio::test]
async fn slack_posts_headline_and_source() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("adapter_failed in istanbul"))
        .and(body_string_contains("https://oda.example/nobet"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let slack = SlackNotifier::new(format!("{}/hook", server.uri()));
    slack.send(&critical("istanbul", AlertKind::AdapterFailed)).await.unwrap();
}

#[tokio::test]
async fn discord_retries_then_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let discord = DiscordNotifier::new(format!("{}/hook", server.uri())).with_retries(2);
    assert!(discord.send(&critical("ankara", AlertKind::FallbackFailed)).await.is_err());
}

#[tokio::test]
async fn hub_cools_down_per_province_and_kind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&server)
        .await;

    let slack: Arc<dyn Notifier> = Arc::new(SlackNotifier::new(format!("{}/hook", server.uri())));
    let hub = NotifyHub::new(vec![slack], 1800);

    assert!(hub.dispatch(&critical("istanbul", AlertKind::AdapterFailed)).await);
    assert!(!hub.dispatch(&critical("istanbul", AlertKind::AdapterFailed)).await);
    assert!(hub.dispatch(&critical("istanbul", AlertKind::ParserErrorThreshold)).await);
    assert!(hub.dispatch(&critical("izmir", AlertKind::AdapterFailed)).await);

    let mut warning = critical("bursa", AlertKind::FallbackUsed);
    warning.severity = Severity::Warning;
    assert!(!hub.dispatch(&warning).await);
}
