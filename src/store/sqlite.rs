//! SQLite implementation of [`IngestStore`].
//!
//! One connection behind a mutex; every call runs on the blocking pool, so
//! statements of different provinces are serialised and a cancelled province
//! transaction always finishes (rolled back) before the next one starts.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    AlertKind, AlertRecord, CancelFlag, DutyRow, IngestStore, PersistSummary, RunRecord, RunStats,
};
use crate::crosscheck::{ConflictItem, CrossCheckOutput, VerifiedRecord};
use crate::duty_window::{ts, window_bounds};
use crate::error::{IngestError, IngestResult};
use crate::ingest::types::{AdapterSpec, ConditionalHeaders, PayloadFormat, SourceEndpoint, SourceRole};
use crate::parse::ParserKey;
use crate::provinces::{self, Province, PROVINCES};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS provinces (
    id INTEGER PRIMARY KEY,
    plate INTEGER NOT NULL,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS districts (
    id INTEGER PRIMARY KEY,
    province_id INTEGER NOT NULL REFERENCES provinces(id),
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    UNIQUE (province_id, slug)
);
CREATE TABLE IF NOT EXISTS pharmacies (
    id INTEGER PRIMARY KEY,
    district_id INTEGER NOT NULL REFERENCES districts(id),
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    address TEXT NOT NULL DEFAULT '',
    phone TEXT NOT NULL DEFAULT '',
    lat REAL,
    lng REAL,
    updated_at TEXT NOT NULL,
    UNIQUE (district_id, normalized_name)
);
CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    source_type TEXT NOT NULL DEFAULT '',
    authority_weight INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS source_endpoints (
    id INTEGER PRIMARY KEY,
    source_id INTEGER NOT NULL REFERENCES sources(id),
    province_id INTEGER NOT NULL REFERENCES provinces(id),
    url TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('primary', 'secondary')),
    format TEXT NOT NULL DEFAULT 'auto',
    parser_key TEXT,
    adapter TEXT NOT NULL DEFAULT '{"kind":"generic"}',
    strict_date INTEGER NOT NULL DEFAULT 0,
    date_selectors TEXT NOT NULL DEFAULT '[]',
    authority_weight INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    UNIQUE (province_id, url)
);
CREATE TABLE IF NOT EXISTS duty_records (
    id INTEGER PRIMARY KEY,
    pharmacy_id INTEGER NOT NULL REFERENCES pharmacies(id),
    province_id INTEGER NOT NULL REFERENCES provinces(id),
    duty_date TEXT NOT NULL,
    duty_start TEXT NOT NULL,
    duty_end TEXT NOT NULL,
    address TEXT NOT NULL DEFAULT '',
    phone TEXT NOT NULL DEFAULT '',
    lat REAL,
    lng REAL,
    confidence INTEGER NOT NULL,
    verification_source_count INTEGER NOT NULL,
    is_degraded INTEGER NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_verified_at TEXT NOT NULL,
    UNIQUE (pharmacy_id, duty_date)
);
CREATE INDEX IF NOT EXISTS idx_duty_records_province_date ON duty_records (province_id, duty_date);
CREATE TABLE IF NOT EXISTS duty_evidence (
    id INTEGER PRIMARY KEY,
    duty_record_id INTEGER NOT NULL REFERENCES duty_records(id),
    endpoint_id INTEGER,
    source_name TEXT NOT NULL,
    source_url TEXT NOT NULL,
    role TEXT NOT NULL,
    authority_weight INTEGER NOT NULL,
    fetched_at TEXT NOT NULL,
    pharmacy_name TEXT NOT NULL,
    address TEXT NOT NULL DEFAULT '',
    phone TEXT NOT NULL DEFAULT '',
    UNIQUE (duty_record_id, source_name, source_url)
);
CREATE TABLE IF NOT EXISTS duty_conflicts (
    id INTEGER PRIMARY KEY,
    province_id INTEGER NOT NULL REFERENCES provinces(id),
    duty_date TEXT NOT NULL,
    district_slug TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    pharmacy_name TEXT NOT NULL,
    reason TEXT NOT NULL,
    fields TEXT NOT NULL,
    primary_source TEXT NOT NULL,
    primary_address TEXT NOT NULL,
    primary_phone TEXT NOT NULL,
    secondary_source TEXT NOT NULL,
    secondary_address TEXT NOT NULL,
    secondary_phone TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    UNIQUE (province_id, duty_date, district_slug, normalized_name,
            primary_address, primary_phone, secondary_address, secondary_phone)
);
CREATE TABLE IF NOT EXISTS ingestion_runs (
    id INTEGER PRIMARY KEY,
    province_slug TEXT NOT NULL,
    endpoint_id INTEGER,
    source_name TEXT NOT NULL,
    source_url TEXT NOT NULL,
    role TEXT NOT NULL,
    adapter TEXT NOT NULL,
    status TEXT NOT NULL,
    http_status INTEGER,
    error_kind TEXT,
    error_message TEXT,
    records INTEGER NOT NULL DEFAULT 0,
    payload_sha256 TEXT,
    etag TEXT,
    last_modified TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ingestion_runs_url_time ON ingestion_runs (source_url, started_at);
CREATE TABLE IF NOT EXISTS ingestion_alerts (
    id INTEGER PRIMARY KEY,
    province_slug TEXT NOT NULL,
    endpoint_id INTEGER,
    source_url TEXT,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_ingestion_alerts_url_kind ON ingestion_alerts (source_url, kind, created_at);
"#;

/// Tables [`SqliteStore::table_count`] may be asked about.
const COUNTABLE: &[&str] = &[
    "provinces",
    "districts",
    "pharmacies",
    "sources",
    "source_endpoints",
    "duty_records",
    "duty_evidence",
    "duty_conflicts",
    "ingestion_runs",
    "ingestion_alerts",
];

/// An alert as read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAlert {
    pub kind: String,
    pub severity: String,
    pub source_url: Option<String>,
    pub message: String,
}

/// A run row as read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    pub source_url: String,
    pub role: String,
    pub status: String,
    pub http_status: Option<u16>,
    pub error_kind: Option<String>,
    pub records: i64,
    pub payload_sha256: Option<String>,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> IngestResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| IngestError::Store(format!("creating {}: {e}", parent.display())))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> IngestResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> IngestResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        for p in PROVINCES.iter() {
            conn.execute(
                "INSERT INTO provinces (plate, name, slug) VALUES (?1, ?2, ?3)
                 ON CONFLICT(slug) DO NOTHING",
                params![i64::from(p.plate), p.name, p.slug()],
            )?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the blocking pool with exclusive access to the connection.
    async fn call<F, T>(&self, f: F) -> IngestResult<T>
    where
        F: FnOnce(&mut Connection) -> IngestResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| IngestError::Store("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| IngestError::Store(format!("store task failed: {e}")))?
    }

    /// Insert or update endpoint rows (and their sources). Returns how many
    /// endpoints were written.
    pub async fn seed_endpoints(&self, endpoints: &[SourceEndpoint]) -> IngestResult<usize> {
        let endpoints = endpoints.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            for ep in &endpoints {
                let province = province_or_err(&ep.province_slug)?;
                let province_id = ensure_province(&tx, province)?;
                let source_id: i64 = tx.query_row(
                    "INSERT INTO sources (name, source_type, authority_weight) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET source_type = excluded.source_type,
                         authority_weight = excluded.authority_weight
                     RETURNING id",
                    params![ep.source_name, ep.source_type, i64::from(ep.authority_weight)],
                    |r| r.get(0),
                )?;
                let adapter = serde_json::to_string(&ep.adapter)
                    .map_err(|e| IngestError::Store(format!("encoding adapter: {e}")))?;
                let selectors = serde_json::to_string(&ep.date_selectors)
                    .map_err(|e| IngestError::Store(format!("encoding selectors: {e}")))?;
                tx.execute(
                    "INSERT INTO source_endpoints
                        (source_id, province_id, url, role, format, parser_key, adapter,
                         strict_date, date_selectors, authority_weight, enabled)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)
                     ON CONFLICT(province_id, url) DO UPDATE SET
                         source_id = excluded.source_id, role = excluded.role,
                         format = excluded.format, parser_key = excluded.parser_key,
                         adapter = excluded.adapter, strict_date = excluded.strict_date,
                         date_selectors = excluded.date_selectors,
                         authority_weight = excluded.authority_weight, enabled = 1",
                    params![
                        source_id,
                        province_id,
                        ep.url,
                        ep.role.as_str(),
                        format_str(ep.format),
                        ep.parser_key.map(|k| k.as_str()),
                        adapter,
                        ep.strict_date,
                        selectors,
                        i64::from(ep.authority_weight),
                    ],
                )?;
                written += 1;
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    /// Turn an endpoint off without deleting its history.
    pub async fn disable_endpoint(&self, id: i64) -> IngestResult<bool> {
        self.call(move |conn| {
            let n = conn.execute("UPDATE source_endpoints SET enabled = 0 WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }

    /// Duty records of a province and date, ordered by district and name.
    pub async fn duty_rows(&self, province_slug: &str, duty_date: NaiveDate) -> IngestResult<Vec<DutyRow>> {
        let slug = province_slug.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT d.slug, p.name, p.normalized_name, dr.address, dr.phone, dr.duty_date,
                        dr.duty_start, dr.duty_end, dr.confidence, dr.verification_source_count,
                        dr.is_degraded, dr.last_verified_at
                 FROM duty_records dr
                 JOIN pharmacies p ON p.id = dr.pharmacy_id
                 JOIN districts d ON d.id = p.district_id
                 JOIN provinces pr ON pr.id = dr.province_id
                 WHERE pr.slug = ?1 AND dr.duty_date = ?2
                 ORDER BY d.slug, p.normalized_name",
            )?;
            let rows = stmt
                .query_map(params![slug, duty_date.to_string()], |r| {
                    let date: String = r.get(5)?;
                    Ok(DutyRow {
                        district_slug: r.get(0)?,
                        pharmacy_name: r.get(1)?,
                        normalized_name: r.get(2)?,
                        address: r.get(3)?,
                        phone: r.get(4)?,
                        duty_date: date.parse().unwrap_or(duty_date),
                        duty_start: r.get(6)?,
                        duty_end: r.get(7)?,
                        confidence: r.get::<_, i64>(8)?.clamp(0, 100) as u8,
                        verification_source_count: r.get::<_, i64>(9)?.clamp(0, 2) as u8,
                        is_degraded: r.get(10)?,
                        last_verified_at: r.get(11)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Active duty records of a province at `now`.
    pub async fn active_duty_rows(&self, province_slug: &str, now: DateTime<Utc>) -> IngestResult<Vec<DutyRow>> {
        let date = crate::duty_window::active_duty_date(now);
        let now_s = ts(now);
        Ok(self
            .duty_rows(province_slug, date)
            .await?
            .into_iter()
            .filter(|r| r.duty_end > now_s)
            .collect())
    }

    pub async fn alerts_for(&self, province_slug: &str) -> IngestResult<Vec<StoredAlert>> {
        let slug = province_slug.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, severity, source_url, message FROM ingestion_alerts
                 WHERE province_slug = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![slug], |r| {
                    Ok(StoredAlert {
                        kind: r.get(0)?,
                        severity: r.get(1)?,
                        source_url: r.get(2)?,
                        message: r.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn runs_for(&self, province_slug: &str) -> IngestResult<Vec<StoredRun>> {
        let slug = province_slug.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT source_url, role, status, http_status, error_kind, records, payload_sha256
                 FROM ingestion_runs WHERE province_slug = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![slug], |r| {
                    Ok(StoredRun {
                        source_url: r.get(0)?,
                        role: r.get(1)?,
                        status: r.get(2)?,
                        http_status: r.get::<_, Option<i64>>(3)?.and_then(|s| u16::try_from(s).ok()),
                        error_kind: r.get(4)?,
                        records: r.get(5)?,
                        payload_sha256: r.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Row count of one of the schema's tables.
    pub async fn table_count(&self, table: &str) -> IngestResult<i64> {
        let Some(table) = COUNTABLE.iter().find(|t| **t == table).copied() else {
            return Err(IngestError::Store(format!("unknown table '{table}'")));
        };
        self.call(move |conn| {
            let n = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
            Ok(n)
        })
        .await
    }
}

fn province_or_err(slug: &str) -> IngestResult<&'static Province> {
    provinces::find(slug).ok_or_else(|| IngestError::Store(format!("unknown province '{slug}'")))
}

fn ensure_province(conn: &Connection, p: &Province) -> IngestResult<i64> {
    let id = conn.query_row(
        "INSERT INTO provinces (plate, name, slug) VALUES (?1, ?2, ?3)
         ON CONFLICT(slug) DO UPDATE SET name = excluded.name
         RETURNING id",
        params![i64::from(p.plate), p.name, p.slug()],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn format_str(f: PayloadFormat) -> &'static str {
    match f {
        PayloadFormat::Auto => "auto",
        PayloadFormat::Html => "html",
        PayloadFormat::Json => "json",
    }
}

fn parse_format(s: &str) -> PayloadFormat {
    match s.trim().to_ascii_lowercase().as_str() {
        "html" => PayloadFormat::Html,
        "json" => PayloadFormat::Json,
        _ => PayloadFormat::Auto,
    }
}

fn upsert_district(conn: &Connection, province_id: i64, rec: &VerifiedRecord) -> IngestResult<i64> {
    let id = conn.query_row(
        "INSERT INTO districts (province_id, name, slug) VALUES (?1, ?2, ?3)
         ON CONFLICT(province_id, slug) DO UPDATE SET name = excluded.name
         RETURNING id",
        params![province_id, rec.district_name, rec.district_slug],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn upsert_pharmacy(conn: &Connection, district_id: i64, rec: &VerifiedRecord, now: &str) -> IngestResult<i64> {
    let id = conn.query_row(
        "INSERT INTO pharmacies (district_id, name, normalized_name, address, phone, lat, lng, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(district_id, normalized_name) DO UPDATE SET
             name = excluded.name, address = excluded.address, phone = excluded.phone,
             lat = COALESCE(excluded.lat, pharmacies.lat), lng = COALESCE(excluded.lng, pharmacies.lng),
             updated_at = excluded.updated_at
         RETURNING id",
        params![
            district_id,
            rec.pharmacy_name,
            rec.normalized_name,
            rec.address,
            rec.phone,
            rec.lat,
            rec.lng,
            now
        ],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn upsert_duty_record(
    conn: &Connection,
    province_id: i64,
    pharmacy_id: i64,
    rec: &VerifiedRecord,
    now: &str,
) -> IngestResult<i64> {
    let (start, end) = window_bounds(rec.duty_date);
    let id = conn.query_row(
        "INSERT INTO duty_records
            (pharmacy_id, province_id, duty_date, duty_start, duty_end, address, phone, lat, lng,
             confidence, verification_source_count, is_degraded, first_seen_at, last_verified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
         ON CONFLICT(pharmacy_id, duty_date) DO UPDATE SET
             duty_end = excluded.duty_end, address = excluded.address, phone = excluded.phone,
             lat = excluded.lat, lng = excluded.lng, confidence = excluded.confidence,
             verification_source_count = excluded.verification_source_count,
             is_degraded = excluded.is_degraded, last_verified_at = excluded.last_verified_at
         RETURNING id",
        params![
            pharmacy_id,
            province_id,
            rec.duty_date.to_string(),
            ts(start),
            ts(end),
            rec.address,
            rec.phone,
            rec.lat,
            rec.lng,
            i64::from(rec.confidence),
            i64::from(rec.verification_source_count),
            rec.is_degraded,
            now,
        ],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn replace_evidence(conn: &Connection, duty_id: i64, rec: &VerifiedRecord) -> IngestResult<usize> {
    conn.execute("DELETE FROM duty_evidence WHERE duty_record_id = ?1", params![duty_id])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO duty_evidence
            (duty_record_id, endpoint_id, source_name, source_url, role, authority_weight,
             fetched_at, pharmacy_name, address, phone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(duty_record_id, source_name, source_url) DO NOTHING",
    )?;
    let mut n = 0;
    for ev in &rec.evidence {
        n += stmt.execute(params![
            duty_id,
            ev.endpoint_id,
            ev.source_name,
            ev.source_url,
            ev.role.as_str(),
            i64::from(ev.authority_weight),
            ts(ev.fetched_at),
            ev.pharmacy_name,
            ev.address,
            ev.phone,
        ])?;
    }
    Ok(n)
}

/// `true` when the conflict is new, `false` when it was already on file.
fn upsert_conflict(conn: &Connection, province_id: i64, c: &ConflictItem, now: &str) -> IngestResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO duty_conflicts
            (province_id, duty_date, district_slug, normalized_name, pharmacy_name, reason, fields,
             primary_source, primary_address, primary_phone,
             secondary_source, secondary_address, secondary_phone, first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
         ON CONFLICT DO NOTHING",
        params![
            province_id,
            c.key.duty_date.to_string(),
            c.key.district_slug,
            c.key.normalized_name,
            c.pharmacy_name,
            c.reason,
            c.fields.join(","),
            c.primary.source_name,
            c.primary.address,
            c.primary.phone,
            c.secondary.source_name,
            c.secondary.address,
            c.secondary.phone,
            now,
        ],
    )?;
    if inserted > 0 {
        return Ok(true);
    }
    conn.execute(
        "UPDATE duty_conflicts SET last_seen_at = ?1
         WHERE province_id = ?2 AND duty_date = ?3 AND district_slug = ?4 AND normalized_name = ?5
           AND primary_address = ?6 AND primary_phone = ?7
           AND secondary_address = ?8 AND secondary_phone = ?9",
        params![
            now,
            province_id,
            c.key.duty_date.to_string(),
            c.key.district_slug,
            c.key.normalized_name,
            c.primary.address,
            c.primary.phone,
            c.secondary.address,
            c.secondary.phone,
        ],
    )?;
    Ok(false)
}

/// Close every active record of `(province, date)` whose key was not seen.
fn expire_unseen(
    conn: &Connection,
    province_id: i64,
    duty_date: NaiveDate,
    seen: &HashSet<(String, String)>,
    now: &str,
) -> IngestResult<usize> {
    let mut stmt = conn.prepare(
        "SELECT dr.id, d.slug, p.normalized_name
         FROM duty_records dr
         JOIN pharmacies p ON p.id = dr.pharmacy_id
         JOIN districts d ON d.id = p.district_id
         WHERE dr.province_id = ?1 AND dr.duty_date = ?2 AND dr.duty_end > ?3",
    )?;
    let active = stmt
        .query_map(params![province_id, duty_date.to_string(), now], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut expired = 0;
    for (id, district_slug, name) in active {
        if seen.contains(&(district_slug, name)) {
            continue;
        }
        expired += conn.execute("UPDATE duty_records SET duty_end = ?1 WHERE id = ?2", params![now, id])?;
    }
    Ok(expired)
}

fn persist_blocking(
    conn: &mut Connection,
    province_slug: &str,
    output: &CrossCheckOutput,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> IngestResult<PersistSummary> {
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }
    let province = province_or_err(province_slug)?;
    let now_s = ts(now);
    let tx = conn.transaction()?;
    let province_id = ensure_province(&tx, province)?;

    let mut summary = PersistSummary::default();
    let mut seen: BTreeMap<NaiveDate, HashSet<(String, String)>> = BTreeMap::new();
    for rec in &output.records {
        let district_id = upsert_district(&tx, province_id, rec)?;
        let pharmacy_id = upsert_pharmacy(&tx, district_id, rec, &now_s)?;
        let duty_id = upsert_duty_record(&tx, province_id, pharmacy_id, rec, &now_s)?;
        summary.evidence_rows += replace_evidence(&tx, duty_id, rec)?;
        summary.records_upserted += 1;
        seen.entry(rec.duty_date)
            .or_default()
            .insert((rec.district_slug.clone(), rec.normalized_name.clone()));
    }
    for c in &output.conflicts {
        if upsert_conflict(&tx, province_id, c, &now_s)? {
            summary.conflicts_new += 1;
        } else {
            summary.conflicts_seen += 1;
        }
    }
    for (date, keys) in &seen {
        summary.expired += expire_unseen(&tx, province_id, *date, keys, &now_s)?;
    }

    if !cancel.claim_commit() {
        tx.rollback()?;
        tracing::warn!(target: "store", province = %province_slug, "pull cancelled, transaction rolled back");
        return Err(IngestError::Cancelled);
    }
    tx.commit()?;
    Ok(summary)
}

fn load_endpoints(conn: &Connection, province_slug: &str) -> IngestResult<Vec<SourceEndpoint>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, p.slug, s.name, s.source_type, COALESCE(e.authority_weight, s.authority_weight),
                e.url, e.format, e.parser_key, e.role, e.adapter, e.strict_date, e.date_selectors
         FROM source_endpoints e
         JOIN sources s ON s.id = e.source_id
         JOIN provinces p ON p.id = e.province_id
         WHERE p.slug = ?1 AND e.enabled = 1
         ORDER BY e.id",
    )?;
    type Raw = (i64, String, String, String, i64, String, String, Option<String>, String, String, bool, String);
    let raw: Vec<Raw> = stmt
        .query_map(params![province_slug], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
                r.get(10)?,
                r.get(11)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(raw.len());
    for (id, slug, name, source_type, weight, url, format, parser_key, role, adapter, strict, selectors) in raw {
        let Some(role) = SourceRole::parse(&role) else {
            tracing::warn!(target: "store", endpoint_id = id, role = %role, "endpoint skipped: bad role");
            continue;
        };
        let adapter = match serde_json::from_str::<AdapterSpec>(&adapter) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(target: "store", endpoint_id = id, error = %e, "endpoint skipped: bad adapter");
                continue;
            }
        };
        out.push(SourceEndpoint {
            id,
            province_slug: slug,
            source_name: name,
            source_type,
            authority_weight: weight.clamp(0, 100) as u8,
            url,
            format: parse_format(&format),
            parser_key: parser_key.as_deref().and_then(ParserKey::parse),
            role,
            adapter,
            strict_date: strict,
            date_selectors: serde_json::from_str(&selectors).unwrap_or_default(),
        });
    }
    Ok(out)
}

#[async_trait]
impl IngestStore for SqliteStore {
    async fn endpoints_for(&self, province_slug: &str) -> IngestResult<Vec<SourceEndpoint>> {
        let slug = province_slug.to_string();
        self.call(move |conn| load_endpoints(conn, &slug)).await
    }

    async fn known_districts(&self, province_slug: &str) -> IngestResult<Vec<String>> {
        let slug = province_slug.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT d.name FROM districts d JOIN provinces p ON p.id = d.province_id
                 WHERE p.slug = ?1 ORDER BY d.name",
            )?;
            let names = stmt
                .query_map(params![slug], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn latest_validators(&self) -> IngestResult<Vec<(String, ConditionalHeaders)>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_url, etag, last_modified FROM ingestion_runs
                 WHERE id IN (
                     SELECT MAX(id) FROM ingestion_runs
                     WHERE status != 'failed' AND (etag IS NOT NULL OR last_modified IS NOT NULL)
                     GROUP BY source_url
                 )",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        ConditionalHeaders {
                            etag: r.get(1)?,
                            last_modified: r.get(2)?,
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn record_run(&self, run: &RunRecord) -> IngestResult<i64> {
        let run = run.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO ingestion_runs
                    (province_slug, endpoint_id, source_name, source_url, role, adapter, status,
                     http_status, error_kind, error_message, records, payload_sha256, etag,
                     last_modified, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    run.province_slug,
                    run.endpoint_id,
                    run.source_name,
                    run.source_url,
                    run.role.as_str(),
                    run.adapter,
                    run.status.as_str(),
                    run.http_status.map(i64::from),
                    run.error_kind,
                    run.error_message,
                    i64::try_from(run.records).unwrap_or(i64::MAX),
                    run.payload_sha256,
                    run.etag,
                    run.last_modified,
                    ts(run.started_at),
                    ts(run.finished_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn raise_alert(&self, alert: &AlertRecord) -> IngestResult<i64> {
        let alert = alert.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO ingestion_alerts
                    (province_slug, endpoint_id, source_url, kind, severity, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.province_slug,
                    alert.endpoint_id,
                    alert.source_url,
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.message,
                    ts(alert.created_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn run_stats_since(&self, source_url: &str, since: DateTime<Utc>) -> IngestResult<RunStats> {
        let url = source_url.to_string();
        self.call(move |conn| {
            let (total, failed): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM ingestion_runs WHERE source_url = ?1 AND started_at >= ?2",
                params![url, ts(since)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            Ok(RunStats {
                total: u32::try_from(total).unwrap_or(u32::MAX),
                failed: u32::try_from(failed).unwrap_or(u32::MAX),
            })
        })
        .await
    }

    async fn alert_exists_since(
        &self,
        source_url: &str,
        kind: AlertKind,
        since: DateTime<Utc>,
    ) -> IngestResult<bool> {
        let url = source_url.to_string();
        self.call(move |conn| {
            let hit: Option<i64> = conn
                .query_row(
                    "SELECT id FROM ingestion_alerts
                     WHERE source_url = ?1 AND kind = ?2 AND created_at >= ?3 LIMIT 1",
                    params![url, kind.as_str(), ts(since)],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    async fn persist_province(
        &self,
        province_slug: &str,
        output: &CrossCheckOutput,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> IngestResult<PersistSummary> {
        let slug = province_slug.to_string();
        let output = output.clone();
        let cancel = cancel.clone();
        let summary = self
            .call(move |conn| persist_blocking(conn, &slug, &output, now, &cancel))
            .await?;
        if summary.expired > 0 {
            counter!("duty_records_expired_total").increment(summary.expired as u64);
        }
        tracing::info!(
            target: "store",
            province = %province_slug,
            records = summary.records_upserted,
            evidence = summary.evidence_rows,
            conflicts_new = summary.conflicts_new,
            expired = summary.expired,
            "province persisted"
        );
        Ok(summary)
    }

    async fn provinces_with_endpoints(&self) -> IngestResult<Vec<String>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT p.slug FROM source_endpoints e JOIN provinces p ON p.id = e.province_id
                 WHERE e.enabled = 1 ORDER BY p.slug",
            )?;
            let slugs = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(slugs)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_seeds_provinces() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.table_count("provinces").await.unwrap(), 81);
        assert!(store.table_count("sqlite_master").await.is_err());
        // Re-applying the schema is harmless.
        let again = {
            let conn = store.conn.lock().unwrap();
            conn.execute_batch(SCHEMA).is_ok()
        };
        assert!(again);
    }

    #[tokio::test]
    async fn cancelled_persist_writes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = store
            .persist_province("istanbul", &CrossCheckOutput::default(), Utc::now(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert_eq!(store.table_count("duty_records").await.unwrap(), 0);
    }

    #[test]
    fn cancel_and_commit_claim_exclude_each_other() {
        let cancelled = CancelFlag::new();
        assert!(cancelled.cancel());
        assert!(cancelled.cancel());
        assert!(!cancelled.claim_commit());
        assert!(cancelled.is_cancelled());

        let committing = CancelFlag::new();
        assert!(committing.claim_commit());
        assert!(!committing.cancel());
        assert!(!committing.is_cancelled());
    }

    #[test]
    fn format_names_round_trip() {
        for f in [PayloadFormat::Auto, PayloadFormat::Html, PayloadFormat::Json] {
            assert_eq!(parse_format(format_str(f)), f);
        }
    }
}
