//! Layouts seen on individual city sites that the generic strategies miss:
//! bootstrap list groups, `<dl>` rosters and bare text blocks.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use super::{element_text, html_to_lines, mentions_pharmacy, strip_label, ParseContext, ParsedRow};
use crate::normalize::{extract_phone, fold_upper};

static LIST_ITEMS: Lazy<Selector> = Lazy::new(|| Selector::parse(".list-group-item, ul > li, ol > li").unwrap());
static TEL_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"a[href^="tel:"]"#).unwrap());
static DL: Lazy<Selector> = Lazy::new(|| Selector::parse("dl").unwrap());
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

/// Row from a block of lines: name line, phone line, longest other line as address.
fn row_from_lines(lines: &[String], phone_hint: Option<String>) -> Option<ParsedRow> {
    let name = lines
        .iter()
        .find(|l| mentions_pharmacy(l) && extract_phone(l).is_none())
        .or_else(|| lines.iter().find(|l| extract_phone(l).is_none()))?
        .clone();
    let phone = phone_hint.or_else(|| lines.iter().find_map(|l| extract_phone(l)))?;
    let address = lines
        .iter()
        .filter(|l| **l != name && extract_phone(l).is_none())
        .map(|l| strip_label(l))
        .filter(|l| !l.is_empty())
        .max_by_key(|l| l.chars().count())
        .unwrap_or_default();
    Some(ParsedRow {
        pharmacy_name: strip_label(&name),
        address,
        phone,
        ..Default::default()
    })
}

fn tel_href(el: &ElementRef<'_>) -> Option<String> {
    el.select(&TEL_LINK)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| extract_phone(href.trim_start_matches("tel:")))
}

/// A short phone-less line without a pharmacy mention reads as a district heading.
fn is_heading_line(line: &str) -> bool {
    let count = line.chars().count();
    (3..=40).contains(&count)
        && extract_phone(line).is_none()
        && !mentions_pharmacy(line)
        && !line.chars().any(|c| c.is_ascii_digit())
}

/// Bootstrap `.list-group-item` or plain `<li>` rosters; items without a
/// phone act as district headings for the items after them.
pub fn parse_list_group(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    let mut section = String::new();
    let mut out = Vec::new();
    for item in doc.select(&LIST_ITEMS) {
        let lines = html_to_lines(&item.inner_html());
        let tel = tel_href(&item);
        if tel.is_none() && !lines.iter().any(|l| extract_phone(l).is_some()) {
            let text = element_text(&item);
            if is_heading_line(&text) {
                section = text;
            }
            continue;
        }
        if let Some(mut row) = row_from_lines(&lines, tel) {
            row.district_name = section.clone();
            out.push(row);
        }
    }
    out
}

#[derive(Default)]
struct DlDraft {
    row: ParsedRow,
    details: Vec<String>,
}

impl DlDraft {
    fn finish(self) -> Option<ParsedRow> {
        let mut row = self.row;
        if row.pharmacy_name.is_empty() {
            return None;
        }
        if row.phone.is_empty() {
            row.phone = self.details.iter().find_map(|l| extract_phone(l)).unwrap_or_default();
        }
        if row.address.is_empty() {
            row.address = self
                .details
                .iter()
                .filter(|l| extract_phone(l).is_none())
                .map(|l| strip_label(l))
                .max_by_key(|l| l.chars().count())
                .unwrap_or_default();
        }
        Some(row)
    }
}

enum DlLabel {
    Name,
    Address,
    Phone,
    District,
}

fn dl_label(text: &str) -> Option<DlLabel> {
    let f = fold_upper(text);
    let f = f.trim().trim_end_matches(':').trim();
    if f.len() > 24 {
        return None;
    }
    match f {
        "ECZANE" | "ECZANE ADI" | "ADI" | "ISIM" | "AD" => Some(DlLabel::Name),
        "ADRES" | "ADRESI" => Some(DlLabel::Address),
        "TEL" | "TELEFON" | "TELEFON NO" | "GSM" => Some(DlLabel::Phone),
        "ILCE" | "BOLGE" | "SEMT" => Some(DlLabel::District),
        _ => None,
    }
}

/// `<dl>` rosters, either `dt`=name / `dd`=details or `dt`=label / `dd`=value.
pub fn parse_definition_list(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for dl in doc.select(&DL) {
        let mut draft = DlDraft::default();
        let mut pending: Option<DlLabel> = None;
        for child in dl.children().filter_map(ElementRef::wrap) {
            let text = element_text(&child);
            match child.value().name() {
                "dt" => match dl_label(&text) {
                    Some(DlLabel::Name) if !draft.row.pharmacy_name.is_empty() => {
                        out.extend(std::mem::take(&mut draft).finish());
                        pending = Some(DlLabel::Name);
                    }
                    Some(label) => pending = Some(label),
                    None => {
                        out.extend(std::mem::take(&mut draft).finish());
                        draft.row.pharmacy_name = text;
                        pending = None;
                    }
                },
                "dd" => match pending.take() {
                    Some(DlLabel::Name) => draft.row.pharmacy_name = text,
                    Some(DlLabel::Address) => draft.row.address = text,
                    Some(DlLabel::Phone) => {
                        draft.row.phone = tel_href(&child).or_else(|| extract_phone(&text)).unwrap_or(text)
                    }
                    Some(DlLabel::District) => draft.row.district_name = text,
                    None => draft.details.extend(html_to_lines(&child.inner_html())),
                },
                _ => {}
            }
        }
        out.extend(draft.finish());
    }
    out
}

/// Bare text: a pharmacy-name line opens a block that collects lines until
/// the next name line. Short heading lines between blocks set the district.
pub fn parse_text_blocks(html: &str, _ctx: &ParseContext<'_>) -> Vec<ParsedRow> {
    let doc = Html::parse_document(html);
    let body = doc
        .select(&BODY)
        .next()
        .map(|b| b.inner_html())
        .unwrap_or_else(|| html.to_string());
    let lines = html_to_lines(&body);

    let mut out = Vec::new();
    let mut section = String::new();
    let mut block: Vec<String> = Vec::new();
    let flush = |block: &mut Vec<String>, section: &str, out: &mut Vec<ParsedRow>| {
        if block.is_empty() {
            return;
        }
        if let Some(mut row) = row_from_lines(block, None) {
            row.district_name = section.to_string();
            out.push(row);
        }
        block.clear();
    };

    for (i, line) in lines.iter().enumerate() {
        let opens_block = mentions_pharmacy(line) && extract_phone(line).is_none();
        if opens_block {
            flush(&mut block, &section, &mut out);
            block.push(line.clone());
            continue;
        }
        let next_opens = lines
            .get(i + 1)
            .is_some_and(|n| mentions_pharmacy(n) && extract_phone(n).is_none());
        // A lone title line ("Nöbetçi Eczaneler") never became a real block.
        let block_done = block.len() <= 1 || block.iter().any(|l| extract_phone(l).is_some());
        if next_opens && block_done && is_heading_line(line) {
            flush(&mut block, &section, &mut out);
            section = line.clone();
            continue;
        }
        if !block.is_empty() {
            block.push(line.clone());
        }
    }
    flush(&mut block, &section, &mut out);
    out
}
