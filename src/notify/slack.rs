use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

use super::{AlertEvent, Notifier};

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackNotifier {
    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

pub(crate) fn slack_text(ev: &AlertEvent) -> String {
    let mut text = format!("*Duty ingest:* {}\n{}", ev.headline(), ev.message);
    if let Some(url) = &ev.source_url {
        text.push_str(&format!("\nSource: {url}"));
    }
    text.push_str(&format!("\n@ {}", ev.ts.to_rfc3339()));
    text
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, ev: &AlertEvent) -> Result<()> {
        let body = serde_json::json!({ "text": slack_text(ev) });
        self.client
            .post(&self.webhook_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}
