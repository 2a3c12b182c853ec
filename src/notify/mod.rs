//! Webhook fan-out for critical ingestion alerts.
//!
//! Alerts always land in `ingestion_alerts`; this module only pushes the
//! critical ones to chat, one message per (province, kind) per cooldown.

pub mod antiflutter;
pub mod discord;
pub mod slack;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::NotifyConfig;
use crate::store::{AlertKind, AlertRecord, Severity};

pub use antiflutter::AntiFlutter;
pub use discord::DiscordNotifier;
pub use slack::SlackNotifier;

#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub province_slug: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub source_url: Option<String>,
    pub ts: DateTime<Utc>,
}

impl From<&AlertRecord> for AlertEvent {
    fn from(a: &AlertRecord) -> Self {
        Self {
            province_slug: a.province_slug.clone(),
            kind: a.kind,
            severity: a.severity,
            message: a.message.clone(),
            source_url: a.source_url.clone(),
            ts: a.created_at,
        }
    }
}

impl AlertEvent {
    /// One-line summary shared by the chat formats.
    pub fn headline(&self) -> String {
        format!(
            "[{}] {} in {}",
            self.severity.as_str(),
            self.kind.as_str(),
            self.province_slug
        )
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, ev: &AlertEvent) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Configured notifiers behind one cooldown gate.
pub struct NotifyHub {
    notifiers: Vec<Arc<dyn Notifier>>,
    gate: Mutex<AntiFlutter>,
}

impl NotifyHub {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, cooldown_secs: u64) -> Self {
        Self {
            notifiers,
            gate: Mutex::new(AntiFlutter::new(cooldown_secs)),
        }
    }

    pub fn from_config(cfg: &NotifyConfig) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if let Some(url) = cfg.slack_webhook.clone().filter(|u| !u.is_empty()) {
            notifiers.push(Arc::new(SlackNotifier::new(url)));
        }
        if let Some(url) = cfg.discord_webhook.clone().filter(|u| !u.is_empty()) {
            notifiers.push(Arc::new(DiscordNotifier::new(url)));
        }
        Self::new(notifiers, cfg.cooldown_secs)
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Send a critical alert to every notifier unless its (province, kind)
    /// is still cooling down. Returns whether it went out.
    pub async fn dispatch(&self, ev: &AlertEvent) -> bool {
        if ev.severity != Severity::Critical || self.notifiers.is_empty() {
            return false;
        }
        {
            let Ok(mut gate) = self.gate.lock() else {
                return false;
            };
            if !gate.should_alert(&ev.province_slug, ev.kind, ev.ts) {
                tracing::debug!(
                    target: "ingest",
                    province = %ev.province_slug,
                    kind = ev.kind.as_str(),
                    "notification suppressed by cooldown"
                );
                return false;
            }
            gate.record_alert(&ev.province_slug, ev.kind, ev.ts);
        }
        let mut delivered = false;
        for n in &self.notifiers {
            match n.send(ev).await {
                Ok(()) => delivered = true,
                Err(e) => tracing::warn!(target: "ingest", notifier = n.name(), error = %e, "notification failed"),
            }
        }
        delivered
    }
}
