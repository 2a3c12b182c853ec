//! Card/div layouts: one container per pharmacy with a heading, a phone
//! (often a `tel:` link) and an address block, frequently introduced by an
//! icon (`<i class="fa fa-map-marker">`).

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{element_text, html_to_lines, mentions_pharmacy, strip_label, ParseContext, ParsedRow};
use crate::normalize::{extract_phone, normalize_text};

static CONTAINERS: Lazy<Selector> = Lazy::new(|| Selector::parse("div, li, article, section").unwrap());
static HEADINGS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6, .title, .name, .card-title, strong, b").unwrap()
});
static TEL_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"a[href^="tel:"]"#).unwrap());
static ANY: Lazy<Selector> = Lazy::new(|| Selector::parse("*").unwrap());

const CARD_CLASS_HINTS: &[&str] = &["eczane", "pharmacy", "card", "nobet", "duty"];
const ADDRESS_CLASS_HINTS: &[&str] = &["address", "adres"];
const DISTRICT_CLASS_HINTS: &[&str] = &["district", "ilce", "bolge", "region"];
const ADDRESS_ICON_HINTS: &[&str] = &["map", "marker", "location", "home", "adres"];
const PHONE_ICON_HINTS: &[&str] = &["phone", "tel"];

fn class_has(el: &ElementRef<'_>, hints: &[&str]) -> bool {
    el.value().classes().any(|c| {
        let c = c.to_ascii_lowercase();
        hints.iter().any(|h| c.contains(h))
    })
}

fn is_card(el: &ElementRef<'_>) -> bool {
    class_has(el, CARD_CLASS_HINTS)
}

fn is_icon(el: &ElementRef<'_>) -> bool {
    let name = el.value().name();
    name == "i"
        || name == "svg"
        || el.value().classes().any(|c| c.starts_with("fa-") || c.contains("icon") || c == "fa")
}

pub fn parse(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    let cards: Vec<ElementRef<'_>> = doc.select(&CONTAINERS).filter(is_card).collect();

    cards
        .iter()
        // Leaf-most: skip wrappers that contain another card.
        .filter(|card| !card.select(&CONTAINERS).any(|inner| inner.id() != card.id() && is_card(&inner)))
        .filter_map(|card| parse_card(*card))
        .collect()
}

fn parse_card(card: ElementRef<'_>) -> Option<ParsedRow> {
    let lines = html_to_lines(&card.inner_html());

    let headings: Vec<String> = card
        .select(&HEADINGS)
        .map(|h| element_text(&h))
        .filter(|t| !t.is_empty() && extract_phone(t).is_none())
        .collect();
    let name = headings
        .iter()
        .find(|t| mentions_pharmacy(t))
        .or_else(|| headings.first())
        .cloned()
        .or_else(|| lines.iter().find(|l| mentions_pharmacy(l)).cloned())?;

    let phone = card
        .select(&TEL_LINK)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| extract_phone(href.trim_start_matches("tel:")))
        .or_else(|| icon_text(card, PHONE_ICON_HINTS).and_then(|t| extract_phone(&t)))
        .or_else(|| lines.iter().find_map(|l| extract_phone(l)))?;

    let address = card
        .select(&ANY)
        .find(|el| class_has(el, ADDRESS_CLASS_HINTS) && !is_icon(el))
        .map(|el| element_text(&el))
        .filter(|t| !t.is_empty())
        .or_else(|| icon_text(card, ADDRESS_ICON_HINTS))
        .or_else(|| {
            lines
                .iter()
                .filter(|l| **l != name && extract_phone(l).is_none() && l.chars().count() >= 10)
                .max_by_key(|l| l.chars().count())
                .cloned()
        })
        .map(|a| strip_label(&a))
        .unwrap_or_default();

    let district = card
        .select(&ANY)
        .find(|el| class_has(el, DISTRICT_CLASS_HINTS))
        .map(|el| element_text(&el))
        .unwrap_or_default();

    Some(ParsedRow {
        district_name: strip_label(&district),
        pharmacy_name: name,
        address,
        phone,
        lat: None,
        lng: None,
    })
}

/// Text following an icon whose class matches `hints`, up to the next icon.
fn icon_text(card: ElementRef<'_>, hints: &[&str]) -> Option<String> {
    let icon = card.select(&ANY).find(|el| is_icon(el) && class_has(el, hints))?;
    let mut parts = Vec::new();
    for node in icon.next_siblings() {
        if let Some(el) = ElementRef::wrap(node) {
            if is_icon(&el) || (el.value().name() == "br" && !parts.is_empty()) {
                break;
            }
            parts.push(el.text().collect::<Vec<_>>().join(" "));
        } else if let Some(text) = node.value().as_text() {
            parts.push((**text).to_owned());
        }
    }
    let text = normalize_text(&parts.join(" "));
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cards_with_icons_and_tel_links() {
        let html = r#"<div class="row">
          <div class="eczane-card">
            <h4>AA ECZANESİ</h4>
            <p><i class="fa fa-map-marker"></i> Caferağa Mah. Moda Cd. No:5 Kadıköy <i class="fa fa-phone"></i> <a href="tel:+902161112233">0216 111 22 33</a></p>
            <span class="ilce">Kadıköy</span>
          </div>
          <div class="eczane-card">
            <h4>BB ECZANESİ</h4>
            <div class="adres">Bağdat Cd. No:10</div>
            <div>Tel: 0216 111 22 34</div>
          </div>
        </div>"#;
        let rows = parse(html, &ParseContext::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pharmacy_name, "AA ECZANESİ");
        assert_eq!(rows[0].address, "Caferağa Mah. Moda Cd. No:5 Kadıköy");
        assert_eq!(rows[0].phone, "02161112233");
        assert_eq!(rows[0].district_name, "Kadıköy");
        assert_eq!(rows[1].address, "Bağdat Cd. No:10");
        assert_eq!(rows[1].phone, "02161112234");
    }

    #[test]
    fn wrappers_are_not_counted_as_cards() {
        let html = r#"<section class="nobetci-list">
            <article class="pharmacy"><h3>CC ECZANESİ</h3><p>Atatürk Cd. No:1</p><p>0232 444 55 66</p></article>
        </section>"#;
        let rows = parse(html, &ParseContext::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, "Atatürk Cd. No:1");
    }
}
