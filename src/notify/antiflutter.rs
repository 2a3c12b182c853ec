// src/notify/antiflutter.rs
use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::store::AlertKind;

const MAX_COOLDOWN_SECS: u64 = 30 * 86_400;

/// Cooldown gate against notification spam, one clock per (province, kind).
/// - First alert of a key always passes.
/// - Inside the cooldown the same key is suppressed; other keys are not.
/// - State changes only through `record_alert`.
#[derive(Debug, Clone, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
    last: HashMap<(String, AlertKind), DateTime<Utc>>,
}

impl AntiFlutter {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.min(MAX_COOLDOWN_SECS) as i64),
            last: HashMap::new(),
        }
    }

    /// May we alert at `now`? Does NOT mutate state.
    pub fn should_alert(&self, province: &str, kind: AlertKind, now: DateTime<Utc>) -> bool {
        match self.last.get(&(province.to_string(), kind)) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, province: &str, kind: AlertKind, now: DateTime<Utc>) {
        self.last.insert((province.to_string(), kind), now);
    }
}
