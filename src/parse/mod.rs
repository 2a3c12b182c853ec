//! Parser registry.
//!
//! Each strategy is a pure `fn(&str, &ParseContext) -> Vec<ParsedRow>`
//! registered under a [`ParserKey`]. Endpoints may pin a key; otherwise
//! JSON is sniffed and HTML strategies run in priority order until one
//! yields plausible rows. Adding a source layout means adding a variant
//! here and a function in its own module.

pub mod attrs;
pub mod bespoke;
pub mod cards;
pub mod json;
pub mod jsonld;
pub mod markers;
pub mod table;

use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::ElementRef;
use serde::{Deserialize, Serialize};

use crate::ingest::types::PayloadFormat;
use crate::normalize::{clean_display_name, extract_phone, is_valid_name, normalize_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKey {
    Json,
    Table,
    Cards,
    DataAttributes,
    JsonLd,
    MapMarkers,
    ListGroup,
    DefinitionList,
    TextBlocks,
}

impl ParserKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Table => "table",
            Self::Cards => "cards",
            Self::DataAttributes => "data-attributes",
            Self::JsonLd => "json-ld",
            Self::MapMarkers => "map-markers",
            Self::ListGroup => "list-group",
            Self::DefinitionList => "definition-list",
            Self::TextBlocks => "text-blocks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let all = [
            Self::Json,
            Self::Table,
            Self::Cards,
            Self::DataAttributes,
            Self::JsonLd,
            Self::MapMarkers,
            Self::ListGroup,
            Self::DefinitionList,
            Self::TextBlocks,
        ];
        let s = s.trim().to_ascii_lowercase().replace('_', "-");
        all.into_iter().find(|k| k.as_str() == s)
    }
}

/// One extracted row before district resolution and name keying.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRow {
    pub district_name: String,
    pub pharmacy_name: String,
    pub address: String,
    pub phone: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ParseContext<'a> {
    /// Rows carrying their own date outside this set are dropped.
    pub accepted_dates: &'a [NaiveDate],
}

pub type ParseFn = fn(&str, &ParseContext<'_>) -> Vec<ParsedRow>;

pub fn parser_for(key: ParserKey) -> ParseFn {
    match key {
        ParserKey::Json => json::parse,
        ParserKey::Table => table::parse,
        ParserKey::Cards => cards::parse,
        ParserKey::DataAttributes => attrs::parse,
        ParserKey::JsonLd => jsonld::parse,
        ParserKey::MapMarkers => markers::parse,
        ParserKey::ListGroup => bespoke::parse_list_group,
        ParserKey::DefinitionList => bespoke::parse_definition_list,
        ParserKey::TextBlocks => bespoke::parse_text_blocks,
    }
}

/// HTML strategies in priority order.
pub const HTML_STRATEGIES: [ParserKey; 8] = [
    ParserKey::Table,
    ParserKey::Cards,
    ParserKey::DataAttributes,
    ParserKey::JsonLd,
    ParserKey::MapMarkers,
    ParserKey::ListGroup,
    ParserKey::DefinitionList,
    ParserKey::TextBlocks,
];

/// Rows a strategy must produce to win outright.
const CONFIDENT_ROWS: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub rows: Vec<ParsedRow>,
    pub strategy: Option<ParserKey>,
}

/// Body starts like JSON and actually parses as JSON.
pub fn looks_like_json(body: &str) -> bool {
    let t = body.trim_start_matches('\u{feff}').trim_start();
    (t.starts_with('{') || t.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(t).is_ok()
}

/// Run the registry against a payload.
pub fn parse_payload(
    payload: &str,
    format: PayloadFormat,
    hint: Option<ParserKey>,
    ctx: &ParseContext<'_>,
) -> ParseOutput {
    if let Some(key) = hint {
        let rows = sanitize_rows(parser_for(key)(payload, ctx));
        return ParseOutput {
            strategy: (!rows.is_empty()).then_some(key),
            rows,
        };
    }

    let is_json = match format {
        PayloadFormat::Json => true,
        PayloadFormat::Html => false,
        PayloadFormat::Auto => looks_like_json(payload),
    };
    if is_json {
        let rows = sanitize_rows(json::parse(payload, ctx));
        return ParseOutput {
            strategy: (!rows.is_empty()).then_some(ParserKey::Json),
            rows,
        };
    }

    let mut weak: Option<ParseOutput> = None;
    for key in HTML_STRATEGIES {
        let rows = sanitize_rows(parser_for(key)(payload, ctx));
        if rows.len() >= CONFIDENT_ROWS {
            tracing::debug!(target: "ingest", strategy = key.as_str(), rows = rows.len(), "parser strategy matched");
            return ParseOutput {
                rows,
                strategy: Some(key),
            };
        }
        if !rows.is_empty() && weak.is_none() {
            weak = Some(ParseOutput {
                rows,
                strategy: Some(key),
            });
        }
    }
    weak.unwrap_or_default()
}

/// Drop rows without a plausible name or phone; normalize the rest.
pub fn sanitize_rows(rows: Vec<ParsedRow>) -> Vec<ParsedRow> {
    rows.into_iter()
        .filter_map(|row| {
            let name = clean_display_name(&row.pharmacy_name);
            if !is_valid_name(&name) {
                return None;
            }
            let phone = extract_phone(&row.phone)?;
            let (lat, lng) = match (row.lat, row.lng) {
                (Some(la), Some(ln)) if plausible_coords(la, ln) => (Some(la), Some(ln)),
                _ => (None, None),
            };
            Some(ParsedRow {
                district_name: normalize_text(&row.district_name),
                pharmacy_name: name,
                address: normalize_text(&row.address),
                phone,
                lat,
                lng,
            })
        })
        .collect()
}

/// Rough bounding box of Turkey.
fn plausible_coords(lat: f64, lng: f64) -> bool {
    (35.0..=43.0).contains(&lat) && (25.0..=45.5).contains(&lng)
}

/// Whitespace-normalized text content of an element.
pub(crate) fn element_text(el: &ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// Text lines of an HTML fragment, split on block boundaries and `<br>`.
pub(crate) fn html_to_lines(html: &str) -> Vec<String> {
    static RE_SCRIPT: OnceCell<Regex> = OnceCell::new();
    static RE_BREAK: OnceCell<Regex> = OnceCell::new();
    let re_script = RE_SCRIPT
        .get_or_init(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap());
    let re_break = RE_BREAK.get_or_init(|| {
        Regex::new(r"(?i)<br\s*/?>|</?(p|div|li|tr|td|th|h[1-6]|dt|dd|section|article|ul|ol|table)\b[^>]*>").unwrap()
    });
    let without_scripts = re_script.replace_all(html, " ");
    let broken = re_break.replace_all(&without_scripts, "\n");
    broken
        .split('\n')
        .map(normalize_text)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Does a folded line look like it names a pharmacy?
pub(crate) fn mentions_pharmacy(text: &str) -> bool {
    let f = crate::normalize::fold_upper(text);
    f.contains("ECZANE") || f.contains("ECZ.") || f.ends_with(" ECZ")
}

/// Strip a leading `Adres:` / `Tel:` style label.
pub(crate) fn strip_label(text: &str) -> String {
    static RE_LABEL: OnceCell<Regex> = OnceCell::new();
    let re = RE_LABEL.get_or_init(|| {
        Regex::new(r"(?i)^\s*(adres|address|tel(efon)?|phone|gsm|ilçe|ilce|bölge|bolge)\s*[:\.]?\s*").unwrap()
    });
    re.replace(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_through_config_names() {
        assert_eq!(ParserKey::parse("json-ld"), Some(ParserKey::JsonLd));
        assert_eq!(ParserKey::parse("TEXT_BLOCKS"), Some(ParserKey::TextBlocks));
        assert_eq!(ParserKey::parse("pdf"), None);
    }

    #[test]
    fn json_sniffing_requires_valid_json() {
        assert!(looks_like_json("  [{\"a\":1}]"));
        assert!(!looks_like_json("{ not json"));
        assert!(!looks_like_json("<html></html>"));
    }

    #[test]
    fn sanitize_drops_nameless_and_phoneless_rows() {
        let rows = vec![
            ParsedRow {
                pharmacy_name: "AA ECZANESİ".into(),
                phone: "0216 111 22 33".into(),
                ..Default::default()
            },
            ParsedRow {
                pharmacy_name: "12".into(),
                phone: "0216 111 22 33".into(),
                ..Default::default()
            },
            ParsedRow {
                pharmacy_name: "BB ECZANESİ".into(),
                phone: "yok".into(),
                ..Default::default()
            },
        ];
        let out = sanitize_rows(rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].phone, "02161112233");
    }

    #[test]
    fn auto_detection_prefers_json_for_json_bodies() {
        let body = r#"[{"name":"AA ECZANESİ","phone":"02161112233","address":"Moda Cd.","district":"Kadıköy"},
                       {"name":"BB ECZANESİ","phone":"02161112234","address":"Bahariye","district":"Kadıköy"}]"#;
        let ctx = ParseContext::default();
        let out = parse_payload(body, PayloadFormat::Auto, None, &ctx);
        assert_eq!(out.strategy, Some(ParserKey::Json));
        assert_eq!(out.rows.len(), 2);
    }

    #[test]
    fn lines_split_on_breaks_and_blocks() {
        let lines = html_to_lines("<div>AA ECZANESİ<br>Moda Cd. 5</div><script>var x=1;</script><p>Tel: 0216 111 22 33</p>");
        assert_eq!(lines, vec!["AA ECZANESİ", "Moda Cd. 5", "Tel: 0216 111 22 33"]);
    }
}
