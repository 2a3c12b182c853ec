//! Inline data-attribute boxes: `<div data-name=".." data-phone="..">`.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{element_text, ParseContext, ParsedRow};

static BOXES: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("[data-name], [data-eczane], [data-eczane-adi], [data-pharmacy], [data-title]").unwrap()
});

const NAME_ATTRS: &[&str] = &["data-name", "data-eczane", "data-eczane-adi", "data-pharmacy", "data-title"];
const ADDRESS_ATTRS: &[&str] = &["data-address", "data-adres"];
const PHONE_ATTRS: &[&str] = &["data-phone", "data-tel", "data-telefon"];
const DISTRICT_ATTRS: &[&str] = &["data-district", "data-ilce", "data-bolge"];
const LAT_ATTRS: &[&str] = &["data-lat", "data-latitude", "data-enlem"];
const LNG_ATTRS: &[&str] = &["data-lng", "data-lon", "data-long", "data-longitude", "data-boylam"];

fn attr(el: &ElementRef<'_>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| el.value().attr(n))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn coord(el: &ElementRef<'_>, names: &[&str]) -> Option<f64> {
    attr(el, names).and_then(|v| v.replace(',', ".").parse().ok())
}

pub fn parse(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    doc.select(&BOXES)
        .filter_map(|el| {
            let name = attr(&el, NAME_ATTRS)?;
            // Boxes often carry only the name; the phone sits in the body.
            let phone = attr(&el, PHONE_ATTRS).unwrap_or_else(|| element_text(&el));
            Some(ParsedRow {
                district_name: attr(&el, DISTRICT_ATTRS).unwrap_or_default(),
                pharmacy_name: name,
                address: attr(&el, ADDRESS_ATTRS).unwrap_or_default(),
                phone,
                lat: coord(&el, LAT_ATTRS),
                lng: coord(&el, LNG_ATTRS),
            })
        })
        .collect()
}
