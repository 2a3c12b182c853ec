//! # Cross-check
//! Pure merge of a primary and an optional secondary batch into verified,
//! trust-scored records. No I/O; `now` is passed in so the result is fully
//! determined by its inputs.
//!
//! Scoring: `base = round(weight*0.7 + recency*0.3)` with
//! `recency = max(0, 100 - age_minutes)`. A corroborating secondary adds
//! `round(secondary_base*0.35)`; disagreeing address/phone costs 15 and is
//! reported as a [`ConflictItem`]. The newer observation supplies the row.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use serde::Serialize;

use crate::ingest::types::{MatchKey, SourceBatch, SourceMeta, SourceRecord, SourceRole};
use crate::normalize::address_key;

pub const MIN_CONFIDENCE: u8 = 20;
pub const MAX_CONFIDENCE: u8 = 100;
pub const MISMATCH_PENALTY: i64 = 15;
pub const CORROBORATION_SHARE: f64 = 0.35;
pub const CONFLICT_FIELD_MISMATCH: &str = "field_mismatch";

/// One contributing source of a verified record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub endpoint_id: Option<i64>,
    pub source_name: String,
    pub source_url: String,
    pub role: SourceRole,
    pub authority_weight: u8,
    pub fetched_at: DateTime<Utc>,
    pub pharmacy_name: String,
    pub address: String,
    pub phone: String,
}

impl Evidence {
    fn new(meta: &SourceMeta, rec: &SourceRecord) -> Self {
        Self {
            endpoint_id: meta.endpoint_id,
            source_name: meta.source_name.clone(),
            source_url: meta.source_url.clone(),
            role: meta.role,
            authority_weight: meta.authority_weight,
            fetched_at: rec.fetched_at,
            pharmacy_name: rec.pharmacy_name.clone(),
            address: rec.address.clone(),
            phone: rec.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedRecord {
    pub duty_date: NaiveDate,
    pub district_name: String,
    pub district_slug: String,
    pub pharmacy_name: String,
    pub normalized_name: String,
    pub address: String,
    pub phone: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// 20–100.
    pub confidence: u8,
    /// 1 or 2.
    pub verification_source_count: u8,
    pub is_degraded: bool,
    /// Primary first.
    pub evidence: Vec<Evidence>,
}

impl VerifiedRecord {
    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            duty_date: self.duty_date,
            district_slug: self.district_slug.clone(),
            normalized_name: self.normalized_name.clone(),
        }
    }
}

/// One side of a disagreement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictSide {
    pub source_name: String,
    pub source_url: String,
    pub address: String,
    pub phone: String,
    pub fetched_at: DateTime<Utc>,
}

impl ConflictSide {
    fn new(meta: &SourceMeta, rec: &SourceRecord) -> Self {
        Self {
            source_name: meta.source_name.clone(),
            source_url: meta.source_url.clone(),
            address: rec.address.clone(),
            phone: rec.phone.clone(),
            fetched_at: rec.fetched_at,
        }
    }
}

/// Primary and secondary agree on the match key but not on the details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictItem {
    pub key: MatchKey,
    pub district_name: String,
    pub pharmacy_name: String,
    pub reason: &'static str,
    /// `"address"` and/or `"phone"`.
    pub fields: Vec<&'static str>,
    pub primary: ConflictSide,
    pub secondary: ConflictSide,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrossCheckOutput {
    pub records: Vec<VerifiedRecord>,
    pub conflicts: Vec<ConflictItem>,
}

impl CrossCheckOutput {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// `max(0, 100 - minutes since fetch)`; future timestamps count as fresh.
pub fn recency_score(fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_min = (now - fetched_at).num_seconds().max(0) as f64 / 60.0;
    (100.0 - age_min).max(0.0)
}

/// Confidence of a record seen by one source.
pub fn base_score(authority_weight: u8, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let w = f64::from(authority_weight.min(100));
    (w * 0.7 + recency_score(fetched_at, now) * 0.3).round() as i64
}

pub fn clamp_confidence(score: i64) -> u8 {
    score.clamp(i64::from(MIN_CONFIDENCE), i64::from(MAX_CONFIDENCE)) as u8
}

/// Fields that disagree. An empty value on either side is not a disagreement.
fn mismatched_fields(a: &SourceRecord, b: &SourceRecord) -> Vec<&'static str> {
    let mut out = Vec::new();
    if !a.address.is_empty() && !b.address.is_empty() && address_key(&a.address) != address_key(&b.address) {
        out.push("address");
    }
    if !a.phone.is_empty() && !b.phone.is_empty() && a.phone != b.phone {
        out.push("phone");
    }
    out
}

fn verified_from(
    rec: &SourceRecord,
    confidence: u8,
    sources: u8,
    degraded: bool,
    evidence: Vec<Evidence>,
) -> VerifiedRecord {
    VerifiedRecord {
        duty_date: rec.duty_date,
        district_name: rec.district_name.clone(),
        district_slug: rec.district_slug.clone(),
        pharmacy_name: rec.pharmacy_name.clone(),
        normalized_name: rec.normalized_name.clone(),
        address: rec.address.clone(),
        phone: rec.phone.clone(),
        lat: rec.lat,
        lng: rec.lng,
        confidence,
        verification_source_count: sources,
        is_degraded: degraded,
        evidence,
    }
}

/// Merge one province's batches.
///
/// * primary present: one record per primary row, corroborated where the
///   secondary has the same match key; unmatched secondary rows are dropped.
/// * primary absent or empty: every secondary row, degraded, single evidence.
/// * neither: empty output.
pub fn cross_check(
    primary: Option<&SourceBatch>,
    secondary: Option<&SourceBatch>,
    secondary_expected: bool,
    now: DateTime<Utc>,
) -> CrossCheckOutput {
    let primary = primary.filter(|b| !b.records.is_empty());
    let secondary = secondary.filter(|b| !b.records.is_empty());

    let Some(primary) = primary else {
        let Some(secondary) = secondary else {
            return CrossCheckOutput::default();
        };
        let records = secondary
            .records
            .iter()
            .map(|rec| {
                let score = base_score(secondary.meta.authority_weight, rec.fetched_at, now);
                verified_from(
                    rec,
                    clamp_confidence(score),
                    1,
                    true,
                    vec![Evidence::new(&secondary.meta, rec)],
                )
            })
            .collect::<Vec<_>>();
        tracing::warn!(
            target: "crosscheck",
            source = %secondary.meta.source_name,
            records = records.len(),
            "no primary batch, secondary records kept as degraded"
        );
        return CrossCheckOutput {
            records,
            conflicts: Vec::new(),
        };
    };

    // 1) Index secondary by match key (first occurrence wins).
    let mut index: HashMap<MatchKey, &SourceRecord> = HashMap::new();
    if let Some(sec) = secondary {
        for rec in &sec.records {
            index.entry(rec.match_key()).or_insert(rec);
        }
    }

    let mut out = CrossCheckOutput::default();
    for prec in &primary.records {
        let key = prec.match_key();
        let mut score = base_score(primary.meta.authority_weight, prec.fetched_at, now);

        // 2) Counterpart lookup.
        let counterpart = secondary.zip(index.get(&key).copied());
        let Some((sec, srec)) = counterpart else {
            let confidence = clamp_confidence(score);
            out.records.push(verified_from(
                prec,
                confidence,
                1,
                secondary_expected,
                vec![Evidence::new(&primary.meta, prec)],
            ));
            continue;
        };

        // 3) Corroboration bonus.
        let sec_base = base_score(sec.meta.authority_weight, srec.fetched_at, now);
        score += (sec_base as f64 * CORROBORATION_SHARE).round() as i64;

        // 4) Disagreement penalty + conflict.
        let fields = mismatched_fields(prec, srec);
        if !fields.is_empty() {
            score -= MISMATCH_PENALTY;
            out.conflicts.push(ConflictItem {
                key: key.clone(),
                district_name: prec.district_name.clone(),
                pharmacy_name: prec.pharmacy_name.clone(),
                reason: CONFLICT_FIELD_MISMATCH,
                fields,
                primary: ConflictSide::new(&primary.meta, prec),
                secondary: ConflictSide::new(&sec.meta, srec),
            });
        }

        // 5) Newer row wins, ties go to primary.
        let chosen = if srec.fetched_at > prec.fetched_at { srec } else { prec };
        out.records.push(verified_from(
            chosen,
            clamp_confidence(score),
            2,
            false,
            vec![Evidence::new(&primary.meta, prec), Evidence::new(&sec.meta, srec)],
        ));
    }

    if !out.conflicts.is_empty() {
        counter!("crosscheck_conflicts_total").increment(out.conflicts.len() as u64);
    }
    tracing::debug!(
        target: "crosscheck",
        records = out.records.len(),
        corroborated = out.records.iter().filter(|r| r.verification_source_count == 2).count(),
        conflicts = out.conflicts.len(),
        "cross-check done"
    );
    out
}
