//! Schema.org `Pharmacy` blocks in `<script type="application/ld+json">`.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

use super::{ParseContext, ParsedRow};

static LD_JSON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());

const PHARMACY_TYPES: &[&str] = &["Pharmacy", "Drugstore", "MedicalBusiness"];

pub fn parse(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for script in doc.select(&LD_JSON) {
        let body: String = script.text().collect();
        let Ok(value) = serde_json::from_str::<Value>(body.trim()) else {
            continue;
        };
        collect(&value, &mut out, 0);
    }
    out
}

fn collect(v: &Value, out: &mut Vec<ParsedRow>, depth: usize) {
    if depth > 4 {
        return;
    }
    match v {
        Value::Array(items) => items.iter().for_each(|i| collect(i, out, depth + 1)),
        Value::Object(obj) => {
            if let Some(graph) = obj.get("@graph") {
                collect(graph, out, depth + 1);
            }
            if is_pharmacy(obj.get("@type")) {
                if let Some(row) = row_from(v) {
                    out.push(row);
                }
            } else if let Some(list) = obj.get("itemListElement") {
                collect(list, out, depth + 1);
            } else if let Some(item) = obj.get("item") {
                collect(item, out, depth + 1);
            }
        }
        _ => {}
    }
}

fn is_pharmacy(t: Option<&Value>) -> bool {
    match t {
        Some(Value::String(s)) => PHARMACY_TYPES.contains(&s.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|s| PHARMACY_TYPES.contains(&s)),
        _ => false,
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.iter().find_map(|i| text(Some(i))),
        _ => None,
    }
}

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn row_from(v: &Value) -> Option<ParsedRow> {
    let name = text(v.get("name"))?;
    let (address, district) = match v.get("address") {
        Some(Value::Object(addr)) => {
            let street = text(addr.get("streetAddress")).unwrap_or_default();
            let locality = text(addr.get("addressLocality")).unwrap_or_default();
            let full = [street.as_str(), locality.as_str()]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            (full, locality)
        }
        other => (text(other).unwrap_or_default(), String::new()),
    };
    let geo = v.get("geo");
    Some(ParsedRow {
        district_name: district,
        pharmacy_name: name,
        address,
        phone: text(v.get("telephone")).unwrap_or_default(),
        lat: number(geo.and_then(|g| g.get("latitude"))),
        lng: number(geo.and_then(|g| g.get("longitude"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_and_postal_address() {
        let html = r#"<html><head><script type="application/ld+json">
        {"@context":"https://schema.org","@graph":[
          {"@type":"WebPage","name":"Nöbetçi Eczaneler"},
          {"@type":"Pharmacy","name":"AA ECZANESİ","telephone":"+90 216 111 22 33",
           "address":{"@type":"PostalAddress","streetAddress":"Moda Cd. 5","addressLocality":"Kadıköy"},
           "geo":{"@type":"GeoCoordinates","latitude":40.98,"longitude":"29.02"}}
        ]}
        </script>
        <script type="application/ld+json">[{"@type":"Pharmacy","name":"BB ECZANESİ","telephone":"02161112234","address":"Bağdat Cd."}]</script>
        </head></html>"#;
        let rows = parse(html, &ParseContext::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].address, "Moda Cd. 5 Kadıköy");
        assert_eq!(rows[0].district_name, "Kadıköy");
        assert_eq!(rows[0].lng, Some(29.02));
        assert_eq!(rows[1].address, "Bağdat Cd.");
    }
}
