// src/ingest/mod.rs
pub mod config;
pub mod freshness;
pub mod providers;
pub mod repository;
pub mod scheduler;
pub mod types;

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

use crate::ingest::types::{FetchContext, SourceBatch, SourceEndpoint, SourceMeta, SourceRecord};
use crate::normalize::district::DistrictLexicon;
use crate::normalize::pharmacy_key;
use crate::parse::ParsedRow;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Endpoint attempts by status.");
        describe_counter!("ingest_alerts_total", "Ingestion alerts raised by kind.");
        describe_counter!(
            "ingest_rows_parsed_total",
            "Rows kept after parsing, validation and dedup."
        );
        describe_counter!(
            "ingest_discovery_used_total",
            "Batches recovered from a discovered related URL."
        );
        describe_histogram!("ingest_parse_ms", "Parse time per payload in milliseconds.");
        describe_counter!(
            "crosscheck_conflicts_total",
            "Field mismatches between primary and secondary sources."
        );
        describe_counter!(
            "duty_records_expired_total",
            "Duty records expired because no source listed them anymore."
        );
        describe_histogram!("province_pull_ms", "Wall time of one province pull.");
        describe_counter!("scheduler_jobs_total", "Scheduler jobs by kind and outcome.");
        describe_gauge!("scheduler_in_flight", "Province pulls currently running.");
    });
}

/// Short SHA-256 hex of a payload, safe to log in place of the body.
pub fn payload_digest(payload: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Turn parsed rows into a batch for the active duty date.
pub fn build_batch(
    endpoint: &SourceEndpoint,
    rows: Vec<ParsedRow>,
    ctx: &FetchContext,
    fetched_at: DateTime<Utc>,
) -> SourceBatch {
    build_batch_for_date(endpoint, rows, ctx, ctx.duty_date, fetched_at)
}

/// Turn parsed rows into a batch stamped with `duty_date`: resolve
/// districts, key names, drop duplicate match keys (first occurrence wins).
pub fn build_batch_for_date(
    endpoint: &SourceEndpoint,
    rows: Vec<ParsedRow>,
    ctx: &FetchContext,
    duty_date: NaiveDate,
    fetched_at: DateTime<Utc>,
) -> SourceBatch {
    let lexicon = DistrictLexicon::for_province(&endpoint.province_slug, &ctx.known_districts);
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let district = lexicon.resolve(&row.district_name, &row.address);
        let normalized_name = pharmacy_key(&row.pharmacy_name);
        if normalized_name.is_empty() {
            continue;
        }
        let record = SourceRecord {
            district_name: district.name,
            district_slug: district.slug,
            pharmacy_name: row.pharmacy_name,
            normalized_name,
            address: row.address,
            phone: row.phone,
            lat: row.lat,
            lng: row.lng,
            duty_date,
            fetched_at,
        };
        if seen.insert(record.match_key()) {
            records.push(record);
        }
    }

    counter!("ingest_rows_parsed_total").increment(records.len() as u64);
    SourceBatch {
        meta: SourceMeta::for_endpoint(endpoint),
        records,
    }
}
