//! Roster date gate.
//!
//! Pages rarely say which day they describe in a structured way. We pull
//! dates out of configured selectors, or out of lines near words like
//! "nöbet"/"tarih", and compare them with the accepted duty dates.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::types::SourceEndpoint;
use crate::error::{IngestError, IngestResult};
use crate::normalize::fold_upper;
use crate::parse::html_to_lines;

static RE_DMY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})[./\-](\d{1,2})[./\-](\d{4})\b").unwrap());
static RE_YMD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").unwrap());
// Runs on folded text, so month names are plain ASCII.
static RE_MONTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(\d{1,2})\s+(OCAK|SUBAT|MART|NISAN|MAYIS|HAZIRAN|TEMMUZ|AGUSTOS|EYLUL|EKIM|KASIM|ARALIK)\s+(\d{4})\b",
    )
    .unwrap()
});

const MONTHS: [&str; 12] = [
    "OCAK", "SUBAT", "MART", "NISAN", "MAYIS", "HAZIRAN", "TEMMUZ", "AGUSTOS", "EYLUL", "EKIM", "KASIM",
    "ARALIK",
];

const DATE_KEYWORDS: &[&str] = &["NOBET", "TARIH", "GUNU", "BUGUN"];

/// Every date mentioned in `text`, in order of appearance, without repeats.
pub fn find_dates(text: &str) -> Vec<NaiveDate> {
    let folded = fold_upper(text);
    let mut found: Vec<(usize, NaiveDate)> = Vec::new();

    for c in RE_DMY.captures_iter(&folded) {
        if let (Some(d), Some(m), Some(y)) = (num(&c, 1), num(&c, 2), num(&c, 3)) {
            if let Some(date) = NaiveDate::from_ymd_opt(y as i32, m, d) {
                found.push((c.get(0).map_or(0, |m| m.start()), date));
            }
        }
    }
    for c in RE_YMD.captures_iter(&folded) {
        if let (Some(y), Some(m), Some(d)) = (num(&c, 1), num(&c, 2), num(&c, 3)) {
            if let Some(date) = NaiveDate::from_ymd_opt(y as i32, m, d) {
                found.push((c.get(0).map_or(0, |m| m.start()), date));
            }
        }
    }
    for c in RE_MONTH.captures_iter(&folded) {
        let month = c
            .get(2)
            .and_then(|m| MONTHS.iter().position(|name| *name == m.as_str()))
            .map(|idx| idx as u32 + 1);
        if let (Some(d), Some(m), Some(y)) = (num(&c, 1), month, num(&c, 3)) {
            if let Some(date) = NaiveDate::from_ymd_opt(y as i32, m, d) {
                found.push((c.get(0).map_or(0, |m| m.start()), date));
            }
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut out: Vec<NaiveDate> = Vec::new();
    for (_, d) in found {
        if !out.contains(&d) {
            out.push(d);
        }
    }
    out
}

fn num(c: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    c.get(idx)?.as_str().parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh(NaiveDate),
    Missing,
    Stale(Vec<NaiveDate>),
}

/// Dates a page claims for itself.
pub fn page_dates(html: &str, selectors: &[String]) -> Vec<NaiveDate> {
    if !selectors.is_empty() {
        let doc = Html::parse_document(html);
        let mut out = Vec::new();
        for raw in selectors {
            let Ok(sel) = Selector::parse(raw) else {
                tracing::warn!(target: "ingest", selector = %raw, "invalid date selector ignored");
                continue;
            };
            for el in doc.select(&sel) {
                let text = el.text().collect::<Vec<_>>().join(" ");
                for d in find_dates(&text) {
                    if !out.contains(&d) {
                        out.push(d);
                    }
                }
            }
        }
        return out;
    }

    let lines = html_to_lines(html);
    let mut out = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let folded = fold_upper(line);
        if !DATE_KEYWORDS.iter().any(|k| folded.contains(k)) {
            continue;
        }
        let mut dates = find_dates(line);
        if dates.is_empty() {
            // "Nöbetçi Eczaneler" heading with the date on the next line.
            if let Some(next) = lines.get(i + 1) {
                dates = find_dates(next);
            }
        }
        for d in dates {
            if !out.contains(&d) {
                out.push(d);
            }
        }
    }
    out
}

/// Verdict over dates a payload claims, earliest-listed accepted date first.
pub fn judge(dates: Vec<NaiveDate>, accepted: &[NaiveDate]) -> Freshness {
    if dates.is_empty() {
        return Freshness::Missing;
    }
    match dates.iter().find(|d| accepted.contains(d)) {
        Some(d) => Freshness::Fresh(*d),
        None => Freshness::Stale(dates),
    }
}

pub fn check(html: &str, selectors: &[String], accepted: &[NaiveDate]) -> Freshness {
    judge(page_dates(html, selectors), accepted)
}

impl Freshness {
    /// Duty date the rows describe. Before the rollover a page may already
    /// show the coming day, so the matched date wins over `fallback`.
    pub fn roster_date(&self, fallback: NaiveDate) -> NaiveDate {
        match self {
            Self::Fresh(d) => *d,
            Self::Missing | Self::Stale(_) => fallback,
        }
    }
}

/// Apply the endpoint's strictness. `Ok(Some(warning))` means the payload was
/// let through despite a missing or outdated date.
pub fn gate(endpoint: &SourceEndpoint, verdict: &Freshness, accepted: &[NaiveDate]) -> IngestResult<Option<String>> {
    let (found, warning) = match verdict {
        Freshness::Fresh(_) => return Ok(None),
        Freshness::Missing => (None, "no roster date found in payload".to_string()),
        Freshness::Stale(dates) => {
            let first = dates.first().copied();
            let shown = first.map(|d| d.to_string()).unwrap_or_default();
            (first, format!("roster dated {shown} is outside the accepted window"))
        }
    };

    if endpoint.strict_date {
        return Err(IngestError::StaleDate {
            source_name: endpoint.source_name.clone(),
            found,
            accepted: accepted.to_vec(),
            payload_sha256: None,
        });
    }
    tracing::warn!(
        target: "ingest",
        endpoint = %endpoint.source_name,
        province = %endpoint.province_slug,
        "{warning}; continuing (lenient)"
    );
    Ok(Some(warning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duty_window::accepted_dates;
    use crate::ingest::types::{AdapterSpec, PayloadFormat, SourceRole};
    use chrono::{TimeZone, Utc};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn endpoint(strict: bool) -> SourceEndpoint {
        SourceEndpoint {
            id: 1,
            province_slug: "istanbul".into(),
            source_name: "Eczacı Odası".into(),
            source_type: "chamber".into(),
            authority_weight: 80,
            url: "https://example.org".into(),
            format: PayloadFormat::Html,
            parser_key: None,
            role: SourceRole::Primary,
            adapter: AdapterSpec::Generic,
            strict_date: strict,
            date_selectors: vec![],
        }
    }

    #[test]
    fn numeric_iso_and_month_name_dates() {
        assert_eq!(find_dates("Tarih: 18.10.2026"), vec![day(2026, 10, 18)]);
        assert_eq!(find_dates("2026-10-17 güncellendi"), vec![day(2026, 10, 17)]);
        assert_eq!(find_dates("18 Ekim 2026 Pazar"), vec![day(2026, 10, 18)]);
        assert_eq!(find_dates("1 ŞUBAT 2027 / 02/02/2027"), vec![day(2027, 2, 1), day(2027, 2, 2)]);
        assert!(find_dates("31.02.2026").is_empty());
    }

    #[test]
    fn selectors_take_precedence_over_keywords() {
        let html = r#"<h1>Nöbetçi Eczaneler 17.10.2026</h1><span class="date">18.10.2026</span>"#;
        assert_eq!(page_dates(html, &[".date".to_string()]), vec![day(2026, 10, 18)]);
        assert_eq!(page_dates(html, &[]), vec![day(2026, 10, 17)]);
    }

    #[test]
    fn yesterday_is_accepted_until_rollover() {
        let html = "<h2>17 Ekim 2026 Nöbetçi Eczaneler</h2>";
        // 07:30 Istanbul on 18 Oct
        let early = accepted_dates(Utc.with_ymd_and_hms(2026, 10, 18, 4, 30, 0).unwrap());
        let verdict = check(html, &[], &early);
        assert!(gate(&endpoint(true), &verdict, &early).unwrap().is_none());
        // 08:05 Istanbul on 18 Oct
        let late = accepted_dates(Utc.with_ymd_and_hms(2026, 10, 18, 5, 5, 0).unwrap());
        let verdict = check(html, &[], &late);
        let err = gate(&endpoint(true), &verdict, &late).unwrap_err();
        assert!(matches!(err, IngestError::StaleDate { found: Some(d), .. } if d == day(2026, 10, 17)));
    }

    #[test]
    fn roster_date_follows_the_matched_date() {
        // 07:30 Istanbul on 18 Oct: the active duty day is still the 17th.
        let early = accepted_dates(Utc.with_ymd_and_hms(2026, 10, 18, 4, 30, 0).unwrap());
        let active = day(2026, 10, 17);

        let today = check("<h1>Nöbetçi Eczaneler 18.10.2026</h1>", &[], &early);
        assert_eq!(today, Freshness::Fresh(day(2026, 10, 18)));
        assert_eq!(today.roster_date(active), day(2026, 10, 18));

        let yesterday = check("<h1>Nöbetçi Eczaneler 17.10.2026</h1>", &[], &early);
        assert_eq!(yesterday.roster_date(active), active);
        assert_eq!(Freshness::Missing.roster_date(active), active);
    }

    #[test]
    fn lenient_mode_warns_and_proceeds() {
        let accepted = [day(2026, 10, 18)];
        let verdict = check("<p>Eczaneler</p>", &[], &accepted);
        let warning = gate(&endpoint(false), &verdict, &accepted).unwrap();
        assert!(warning.unwrap().contains("no roster date"));
        assert!(gate(&endpoint(true), &verdict, &accepted).is_err());
    }
}
