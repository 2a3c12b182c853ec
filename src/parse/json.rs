//! JSON payloads: shape-sniff the record array and the field name variants.

use chrono::NaiveDate;
use serde_json::{Map, Value};

use super::{ParseContext, ParsedRow};
use crate::ingest::freshness::find_dates;

const LIST_KEYS: &[&str] = &[
    "data", "result", "results", "items", "eczaneler", "pharmacies", "list", "records",
    "nobetciler", "nobetcieczaneler", "rows",
];
const NAME_KEYS: &[&str] = &[
    "pharmacyname", "eczaneadi", "eczaneismi", "eczane", "name", "adi", "ad", "isim", "title",
];
const ADDRESS_KEYS: &[&str] = &["address", "adres", "fulladdress", "acikadres", "adresi"];
const PHONE_KEYS: &[&str] = &["phone", "telefon", "tel", "phonenumber", "telefonno", "telno", "gsm"];
const DISTRICT_KEYS: &[&str] = &[
    "district", "ilce", "ilceadi", "county", "region", "bolge", "semt", "districtname",
];
const LAT_KEYS: &[&str] = &["lat", "latitude", "enlem"];
const LNG_KEYS: &[&str] = &["lng", "lon", "long", "longitude", "boylam"];
const DATE_KEYS: &[&str] = &["date", "tarih", "dutydate", "nobettarihi", "nobettarih", "gun"];

pub fn parse(payload: &str, ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let trimmed = payload.trim_start_matches('\u{feff}').trim();
    let Ok(root) = serde_json::from_str::<Value>(trimmed) else {
        return Vec::new();
    };
    let Some(items) = find_records(&root, 0) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .filter(|obj| date_matches(obj, ctx))
        .filter_map(row_from_object)
        .collect()
}

/// Fold a key to lowercase ASCII without separators: `Eczane_Adı` → `eczaneadi`.
fn fold_key(k: &str) -> String {
    crate::normalize::fold_upper(k)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn lookup<'v>(obj: &'v Map<String, Value>, variants: &[&str]) -> Option<&'v Value> {
    for want in variants {
        if let Some((_, v)) = obj.iter().find(|(k, v)| fold_key(k) == *want && !v.is_null()) {
            return Some(v);
        }
    }
    None
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn looks_like_record_list(arr: &[Value]) -> bool {
    arr.iter()
        .filter_map(Value::as_object)
        .any(|o| lookup(o, NAME_KEYS).is_some())
}

fn find_records(v: &Value, depth: usize) -> Option<&Vec<Value>> {
    if depth > 3 {
        return None;
    }
    match v {
        Value::Array(arr) if looks_like_record_list(arr) => Some(arr),
        Value::Object(obj) => {
            for key in LIST_KEYS {
                if let Some((_, child)) = obj.iter().find(|(k, _)| fold_key(k) == *key) {
                    if let Some(found) = find_records(child, depth + 1) {
                        return Some(found);
                    }
                }
            }
            obj.values().find_map(|child| find_records(child, depth + 1))
        }
        _ => None,
    }
}

/// First date in a record's date field, if it has one.
fn record_date(obj: &Map<String, Value>) -> Option<NaiveDate> {
    let text = lookup(obj, DATE_KEYS).and_then(as_text)?;
    find_dates(&text).into_iter().next()
}

fn date_matches(obj: &Map<String, Value>, ctx: &ParseContext<'_>) -> bool {
    if ctx.accepted_dates.is_empty() {
        return true;
    }
    record_date(obj).map_or(true, |d| ctx.accepted_dates.contains(&d))
}

/// Duty dates the records carry, newest first. Empty when the payload is
/// not a record list or no record is dated.
pub fn record_dates(payload: &str) -> Vec<NaiveDate> {
    let trimmed = payload.trim_start_matches('\u{feff}').trim();
    let Ok(root) = serde_json::from_str::<Value>(trimmed) else {
        return Vec::new();
    };
    let Some(items) = find_records(&root, 0) else {
        return Vec::new();
    };
    let mut dates: Vec<NaiveDate> = items.iter().filter_map(Value::as_object).filter_map(record_date).collect();
    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.dedup();
    dates
}

fn row_from_object(obj: &Map<String, Value>) -> Option<ParsedRow> {
    let name = lookup(obj, NAME_KEYS).and_then(as_text)?;
    Some(ParsedRow {
        district_name: lookup(obj, DISTRICT_KEYS).and_then(as_text).unwrap_or_default(),
        pharmacy_name: name,
        address: lookup(obj, ADDRESS_KEYS).and_then(as_text).unwrap_or_default(),
        phone: lookup(obj, PHONE_KEYS).and_then(as_text).unwrap_or_default(),
        lat: lookup(obj, LAT_KEYS).and_then(as_f64),
        lng: lookup(obj, LNG_KEYS).and_then(as_f64),
    })
}
