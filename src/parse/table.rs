//! `<table>` rosters: header keyword detection, section rows as district
//! labels, heuristics when no header is present.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{element_text, mentions_pharmacy, strip_label, ParseContext, ParsedRow};
use crate::normalize::{extract_phone, fold_upper};

static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static TR: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static TEL_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"a[href^="tel:"]"#).unwrap());

#[derive(Debug, Clone, Default)]
struct Columns {
    name: Option<usize>,
    address: Option<usize>,
    phone: Option<usize>,
    district: Option<usize>,
}

pub fn parse(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    doc.select(&TABLE).flat_map(parse_table).collect()
}

fn parse_table(table: ElementRef<'_>) -> Vec<ParsedRow> {
    let mut cols: Option<Columns> = None;
    let mut section = String::new();
    let mut out = Vec::new();

    for tr in table.select(&TR) {
        let cells: Vec<ElementRef<'_>> = tr
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| matches!(c.value().name(), "td" | "th"))
            .collect();
        if cells.is_empty() {
            continue;
        }
        let texts: Vec<String> = cells.iter().map(element_text).collect();

        if let Some(header) = detect_header(&texts) {
            cols = Some(header);
            continue;
        }
        if cells.iter().all(|c| c.value().name() == "th") {
            continue;
        }

        let filled: Vec<&String> = texts.iter().filter(|t| !t.is_empty()).collect();
        if filled.len() == 1 {
            let label = filled[0];
            if extract_phone(label).is_none() && label.chars().count() < 80 {
                section = label.clone();
            }
            continue;
        }

        let row = match &cols {
            Some(c) => by_columns(c, &cells, &texts),
            None => by_heuristic(&cells, &texts),
        };
        if let Some(mut row) = row {
            if row.district_name.is_empty() {
                row.district_name = section.clone();
            }
            out.push(row);
        }
    }
    out
}

fn detect_header(texts: &[String]) -> Option<Columns> {
    if texts.iter().any(|t| extract_phone(t).is_some()) {
        return None;
    }
    let mut cols = Columns::default();
    for (i, t) in texts.iter().enumerate() {
        let f = fold_upper(t);
        let f = f.trim();
        if f.is_empty() || f.len() > 40 {
            continue;
        }
        if cols.phone.is_none() && (f.contains("TELEFON") || f.starts_with("TEL") || f.contains("PHONE")) {
            cols.phone = Some(i);
        } else if cols.address.is_none() && (f.contains("ADRES") || f.contains("ADDRESS")) {
            cols.address = Some(i);
        } else if cols.district.is_none()
            && (f.contains("ILCE") || f.contains("BOLGE") || f.contains("SEMT") || f.contains("DISTRICT"))
        {
            cols.district = Some(i);
        } else if cols.name.is_none()
            && (f.contains("ECZANE") || f.contains("ADI") || f.contains("ISIM") || f.contains("NAME"))
        {
            cols.name = Some(i);
        }
    }
    let keyed = [cols.name, cols.address, cols.phone, cols.district]
        .iter()
        .filter(|c| c.is_some())
        .count();
    if keyed < 2 || (cols.phone.is_none() && cols.address.is_none()) {
        return None;
    }
    if cols.name.is_none() {
        cols.name = (0..texts.len()).find(|i| ![cols.address, cols.phone, cols.district].contains(&Some(*i)));
    }
    Some(cols)
}

fn phone_in_cell(cell: &ElementRef<'_>, text: &str) -> Option<String> {
    cell.select(&TEL_LINK)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| extract_phone(href.trim_start_matches("tel:")))
        .or_else(|| extract_phone(text))
}

fn by_columns(cols: &Columns, cells: &[ElementRef<'_>], texts: &[String]) -> Option<ParsedRow> {
    let get = |idx: Option<usize>| idx.and_then(|i| texts.get(i)).cloned().unwrap_or_default();
    let name = get(cols.name);
    if name.is_empty() {
        return None;
    }
    let phone = cols
        .phone
        .and_then(|i| cells.get(i).zip(texts.get(i)))
        .and_then(|(c, t)| phone_in_cell(c, t))
        .or_else(|| texts.iter().find_map(|t| extract_phone(t)))
        .unwrap_or_default();
    Some(ParsedRow {
        district_name: get(cols.district),
        pharmacy_name: name,
        address: strip_label(&get(cols.address)),
        phone,
        lat: None,
        lng: None,
    })
}

fn by_heuristic(cells: &[ElementRef<'_>], texts: &[String]) -> Option<ParsedRow> {
    let phone_idx = (0..cells.len()).find(|&i| phone_in_cell(&cells[i], &texts[i]).is_some())?;
    let phone = phone_in_cell(&cells[phone_idx], &texts[phone_idx])?;

    let has_letters = |t: &str| t.chars().filter(|c| c.is_alphabetic()).count() >= 3;
    let name_idx = (0..texts.len())
        .filter(|&i| i != phone_idx)
        .find(|&i| mentions_pharmacy(&texts[i]))
        .or_else(|| (0..texts.len()).find(|&i| i != phone_idx && has_letters(&texts[i])))?;

    let rest: Vec<usize> = (0..texts.len())
        .filter(|&i| i != phone_idx && i != name_idx && !texts[i].is_empty())
        .collect();
    let address_idx = rest
        .iter()
        .copied()
        .filter(|&i| texts[i].chars().count() >= 8)
        .max_by_key(|&i| texts[i].chars().count());
    let district_idx = rest
        .iter()
        .copied()
        .filter(|&i| Some(i) != address_idx && has_letters(&texts[i]) && texts[i].chars().count() < 30)
        .find(|&i| i < name_idx || address_idx.is_some());

    Some(ParsedRow {
        district_name: district_idx.map(|i| texts[i].clone()).unwrap_or_default(),
        pharmacy_name: texts[name_idx].clone(),
        address: address_idx.map(|i| strip_label(&texts[i])).unwrap_or_default(),
        phone,
        lat: None,
        lng: None,
    })
}
