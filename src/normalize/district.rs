//! District resolution for noisy labels.
//!
//! Sources label districts as "BUGÜN NÖBETÇİ ECZANELER KADIKÖY", put the
//! district only in the address, or not at all. Resolution order:
//! lexicon match on the label, district found in the address, the cleaned
//! label itself, then the province's center district.

use once_cell::sync::OnceCell;
use regex::Regex;

use super::{fold_upper, fold_words, slugify, title_case_tr};
use crate::provinces;

/// Fallback district when nothing better is known.
pub const CENTER_DISTRICT: &str = "Merkez";

/// Jaro-Winkler similarity needed for a fuzzy lexicon hit.
const FUZZY_MIN: f64 = 0.93;

const NOISE_TOKENS: &[&str] = &[
    "BUGUN", "BUGUNKU", "NOBETCI", "NOBETCILER", "NOBET", "ECZANE", "ECZANELER", "ECZANELERI",
    "ECZANESI", "ECZ", "ILCE", "ILCESI", "ILCELER", "LISTESI", "LISTE", "TARIH", "TARIHLI",
    "GUNU", "SAAT", "VE", "ICIN", "PAZARTESI", "SALI", "CARSAMBA", "PERSEMBE", "CUMARTESI",
    "TUM", "HEPSI", "OCAK", "SUBAT", "MART", "NISAN", "MAYIS", "HAZIRAN", "TEMMUZ", "AGUSTOS",
    "EYLUL", "EKIM", "KASIM", "ARALIK",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDistrict {
    pub name: String,
    pub slug: String,
}

impl ResolvedDistrict {
    fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let slug = slugify(&name);
        Self { name, slug }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    display: String,
    folded: String,
}

/// Known districts of one province.
#[derive(Debug, Clone)]
pub struct DistrictLexicon {
    province_folded: String,
    entries: Vec<Entry>,
}

impl DistrictLexicon {
    /// Lexicon seeded from the built-in list, extended with `extra` names
    /// (typically districts already stored for the province).
    pub fn for_province(province_slug: &str, extra: &[String]) -> Self {
        let province_folded = provinces::find(province_slug)
            .map(|p| fold_upper(p.name))
            .unwrap_or_else(|| fold_upper(province_slug));
        let mut lex = Self {
            province_folded,
            entries: Vec::new(),
        };
        for name in provinces::builtin_districts(province_slug) {
            lex.push(name);
        }
        for name in extra {
            lex.push(name);
        }
        lex
    }

    fn push(&mut self, name: &str) {
        let folded = fold_words(name);
        if folded.is_empty() || folded == fold_upper(CENTER_DISTRICT) {
            return;
        }
        if self.entries.iter().any(|e| e.folded == folded) {
            return;
        }
        self.entries.push(Entry {
            display: name.trim().to_string(),
            folded,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop boilerplate tokens, dates and the province name from a label.
    pub fn sanitize_label(&self, label: &str) -> String {
        let text = super::normalize_text(label);
        text.split(|c: char| !(c.is_alphanumeric() || c == '\u{0307}'))
            .filter(|t| !t.is_empty())
            .filter(|t| {
                let f = fold_upper(t);
                !f.chars().all(|c| c.is_ascii_digit())
                    && !NOISE_TOKENS.contains(&f.as_str())
                    && f != self.province_folded
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn match_label(&self, folded_label: &str) -> Option<&Entry> {
        if folded_label.is_empty() {
            return None;
        }
        if let Some(e) = self.entries.iter().find(|e| e.folded == folded_label) {
            return Some(e);
        }
        // Longest lexicon name contained in the label as whole words.
        if let Some(e) = self
            .entries
            .iter()
            .filter(|e| contains_word(folded_label, &e.folded))
            .max_by_key(|e| e.folded.len())
        {
            return Some(e);
        }
        // Label truncated from a longer official name.
        if folded_label.len() >= 4 {
            if let Some(e) = self
                .entries
                .iter()
                .find(|e| e.folded.starts_with(folded_label))
            {
                return Some(e);
            }
        }
        self.entries
            .iter()
            .map(|e| (e, strsim::jaro_winkler(&e.folded, folded_label)))
            .filter(|(_, score)| *score >= FUZZY_MIN)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(e, _)| e)
    }

    /// District named in a free-text address.
    pub fn from_address(&self, address: &str) -> Option<String> {
        let folded = fold_words(address);
        if folded.is_empty() {
            return None;
        }

        if !self.entries.is_empty() {
            // Prefer the name right before "/Province" or "- Province"; else
            // the last mention, since streets are often named after other
            // districts and the district proper trails the address.
            let raw_folded = fold_upper(address);
            let mut best: Option<(&Entry, usize, bool)> = None;
            for e in &self.entries {
                for pos in word_positions(&folded, &e.folded) {
                    let slash = followed_by_province(&raw_folded, &e.folded, &self.province_folded);
                    let better = match best {
                        None => true,
                        Some((_, bpos, bslash)) => (slash && !bslash) || (slash == bslash && pos > bpos),
                    };
                    if better {
                        best = Some((e, pos, slash));
                    }
                }
            }
            return best.map(|(e, _, _)| e.display.clone());
        }

        static RE_SLASH: OnceCell<Regex> = OnceCell::new();
        let re = RE_SLASH.get_or_init(|| Regex::new(r"([\p{L}]{3,})\s*[/\-]\s*([\p{L}]{3,})\s*$").unwrap());
        let text = super::normalize_text(address);
        let caps = re.captures(&text)?;
        let district = caps.get(1)?.as_str();
        let province = caps.get(2)?.as_str();
        if fold_upper(province) == self.province_folded {
            Some(title_case_tr(district))
        } else {
            None
        }
    }

    /// Resolve the district for a row from its label and address.
    pub fn resolve(&self, label: &str, address: &str) -> ResolvedDistrict {
        let cleaned = self.sanitize_label(label);
        let folded = fold_words(&cleaned);

        if let Some(e) = self.match_label(&folded) {
            return ResolvedDistrict::new(e.display.clone());
        }
        if let Some(name) = self.from_address(address) {
            return ResolvedDistrict::new(name);
        }
        if is_meaningful(&cleaned) {
            return ResolvedDistrict::new(title_case_tr(&cleaned));
        }
        ResolvedDistrict::new(CENTER_DISTRICT)
    }
}

fn is_meaningful(label: &str) -> bool {
    label.chars().filter(|c| c.is_alphabetic()).count() >= 3
}

fn word_positions(hay: &str, needle: &str) -> Vec<usize> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(idx) = hay[from..].find(needle) {
        let start = from + idx;
        let end = start + needle.len();
        let left_ok = start == 0 || !hay[..start].ends_with(|c: char| c.is_alphanumeric());
        let right_ok = end == hay.len() || !hay[end..].starts_with(|c: char| c.is_alphanumeric());
        if left_ok && right_ok {
            out.push(start);
        }
        from = start + needle.len().max(1);
        if from >= hay.len() {
            break;
        }
    }
    out
}

fn contains_word(hay: &str, needle: &str) -> bool {
    !word_positions(hay, needle).is_empty()
}

fn followed_by_province(raw_folded: &str, district: &str, province: &str) -> bool {
    let compact: String = raw_folded.split_whitespace().collect::<Vec<_>>().join(" ");
    [
        format!("{district}/{province}"),
        format!("{district} / {province}"),
        format!("{district} - {province}"),
        format!("{district}-{province}"),
    ]
    .iter()
    .any(|p| compact.contains(p.as_str()))
}
