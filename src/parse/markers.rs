//! Map marker literals in inline scripts: a coordinate pair followed by the
//! balloon/popup HTML for that pharmacy.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::{html_to_lines, mentions_pharmacy, strip_label, ParseContext, ParsedRow};
use crate::normalize::extract_phone;

static SCRIPTS: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());

static RE_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(-?\d{1,2}\.\d{3,})\s*,\s*(-?\d{1,2}\.\d{3,})\s*\]").unwrap());
static RE_NAMED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)["']?lat(?:itude)?["']?\s*[:=]\s*["']?(-?\d{1,2}\.\d{3,})["']?\s*,\s*["']?(?:lng|lon|long|longitude)["']?\s*[:=]\s*["']?(-?\d{1,2}\.\d{3,})"#,
    )
    .unwrap()
});
static RE_POPUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:bindPopup|balloonContent(?:Body|Header)?|content|popup|html|info)["']?\s*[:(=]\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|`([^`]*)`)"#,
    )
    .unwrap()
});
static RE_UNICODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\u([0-9a-fA-F]{4})").unwrap());

struct Marker {
    start: usize,
    end: usize,
    lat: f64,
    lng: f64,
}

pub fn parse(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    doc.select(&SCRIPTS)
        .flat_map(|s| parse_script(&s.text().collect::<String>()))
        .collect()
}

fn parse_script(js: &str) -> Vec<ParsedRow> {
    let mut markers: Vec<Marker> = RE_PAIR
        .captures_iter(js)
        .chain(RE_NAMED.captures_iter(js))
        .filter_map(|c| {
            let whole = c.get(0)?;
            Some(Marker {
                start: whole.start(),
                end: whole.end(),
                lat: c.get(1)?.as_str().parse().ok()?,
                lng: c.get(2)?.as_str().parse().ok()?,
            })
        })
        .collect();
    markers.sort_by_key(|m| m.start);

    let mut out = Vec::new();
    for (i, m) in markers.iter().enumerate() {
        let limit = markers
            .get(i + 1)
            .map(|next| next.start)
            .unwrap_or(js.len())
            .max(m.end);
        let Some(popup) = RE_POPUP.captures(&js[m.end..limit]) else {
            continue;
        };
        let Some(literal) = popup.get(1).or_else(|| popup.get(2)).or_else(|| popup.get(3)) else {
            continue;
        };
        if let Some(mut row) = row_from_balloon(&unescape_js(literal.as_str())) {
            row.lat = Some(m.lat);
            row.lng = Some(m.lng);
            out.push(row);
        }
    }
    out
}

fn unescape_js(s: &str) -> String {
    let decoded = RE_UNICODE.replace_all(s, |c: &regex::Captures<'_>| {
        u32::from_str_radix(&c[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    decoded
        .replace("\\n", "\n")
        .replace("\\t", " ")
        .replace("\\/", "/")
        .replace("\\\"", "\"")
        .replace("\\'", "'")
        .replace("\\\\", "\\")
}

fn row_from_balloon(balloon: &str) -> Option<ParsedRow> {
    let lines = html_to_lines(balloon);
    let name = lines
        .iter()
        .find(|l| mentions_pharmacy(l))
        .or_else(|| lines.first())?
        .clone();
    let phone = lines.iter().find_map(|l| extract_phone(l))?;
    let address = lines
        .iter()
        .filter(|l| **l != name && extract_phone(l).is_none())
        .map(|l| strip_label(l))
        .max_by_key(|l| l.chars().count())
        .unwrap_or_default();
    Some(ParsedRow {
        district_name: String::new(),
        pharmacy_name: name,
        address,
        phone,
        lat: None,
        lng: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaflet_and_yandex_styles() {
        let html = r#"<script>
          var m1 = L.marker([40.9876, 29.0271]).addTo(map).bindPopup("<b>AA ECZANESİ</b><br>Moda Cd. No:5<br>Tel: 0216 111 22 33");
          var p = new ymaps.Placemark({lat: 41.0221, lng: 29.0152}, {balloonContent: '<strong>BB ECZANESİ</strong><br/>Hakimiyeti Milliye Cd. 3<br/>0216 111 22 34'});
          var noise = [1.5, 2.5];
        </script>"#;
        let rows = parse(html, &ParseContext::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pharmacy_name, "AA ECZANESİ");
        assert_eq!(rows[0].address, "Moda Cd. No:5");
        assert_eq!(rows[0].lat, Some(40.9876));
        assert_eq!(rows[1].phone, "02161112234");
        assert_eq!(rows[1].lng, Some(29.0152));
    }
}
