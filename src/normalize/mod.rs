//! Text normalization shared by parsers and the cross-check.
//!
//! Everything here is pure and locale-aware for Turkish: dotted/dotless `i`
//! and the six extra letters fold to ASCII for comparison keys, while
//! display strings keep their original spelling.

pub mod district;

use once_cell::sync::OnceCell;
use regex::Regex;

/// Decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    if out.chars().count() > 500 {
        out = out.chars().take(500).collect();
    }
    out
}

fn fold_char(c: char) -> Option<char> {
    Some(match c {
        'ç' | 'Ç' => 'C',
        'ğ' | 'Ğ' => 'G',
        'ı' | 'I' | 'i' | 'İ' | 'î' | 'Î' => 'I',
        'ö' | 'Ö' => 'O',
        'ş' | 'Ş' => 'S',
        'ü' | 'Ü' | 'û' | 'Û' => 'U',
        'â' | 'Â' => 'A',
        // combining dot above left behind by naive lowercasing of `İ`
        '\u{0307}' => return None,
        c if c.is_ascii() => c.to_ascii_uppercase(),
        c => c.to_uppercase().next().unwrap_or(c),
    })
}

/// Uppercase ASCII fold: `"Kadıköy"` → `"KADIKOY"`.
pub fn fold_upper(s: &str) -> String {
    s.chars().filter_map(fold_char).collect()
}

/// Turkish-aware single character uppercase.
pub fn tr_upper(c: char) -> char {
    match c {
        'i' => 'İ',
        'ı' => 'I',
        c => c.to_uppercase().next().unwrap_or(c),
    }
}

/// Turkish-aware single character lowercase.
pub fn tr_lower(c: char) -> char {
    match c {
        'I' => 'ı',
        'İ' => 'i',
        c => c.to_lowercase().next().unwrap_or(c),
    }
}

/// `"KADIKÖY"` → `"Kadıköy"`, `"gaziosmanpaşa"` → `"Gaziosmanpaşa"`.
pub fn title_case_tr(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut cs = w.chars().filter(|c| *c != '\u{0307}');
            match cs.next() {
                Some(first) => {
                    let mut word = String::with_capacity(w.len());
                    word.push(tr_upper(first));
                    word.extend(cs.map(tr_lower));
                    word
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL/DB slug: folded, lowercase, `-` separated.
pub fn slugify(s: &str) -> String {
    let folded = fold_upper(s).to_ascii_lowercase();
    let mut out = String::with_capacity(folded.len());
    let mut dash = false;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Folded uppercase words with punctuation turned into spaces.
pub fn fold_words(s: &str) -> String {
    let folded: String = fold_upper(s)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

const NAME_SUFFIXES: &[&str] = &["ECZANESI", "ECZANE", "ECZ", "ECZA", "ECZAHANESI", "ECZAHANE"];

/// Compare key used to join pharmacies across sources.
///
/// `"AA ECZANESİ"`, `"Aa Eczanesi"` and `"AA ECZ."` all map to `"AA"`.
pub fn pharmacy_key(name: &str) -> String {
    let folded = fold_words(name);
    let mut tokens: Vec<&str> = folded.split(' ').filter(|t| !t.is_empty()).collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| NAME_SUFFIXES.contains(t)) {
        tokens.pop();
    }
    tokens.join(" ")
}

/// Display name: entity-decoded, whitespace-collapsed, list numbering removed.
pub fn clean_display_name(raw: &str) -> String {
    static RE_ENUM: OnceCell<Regex> = OnceCell::new();
    let re = RE_ENUM.get_or_init(|| Regex::new(r"^\s*\d{1,3}\s*[\.\)\-]\s*").unwrap());
    let text = normalize_text(raw);
    re.replace(&text, "")
        .trim_matches(|c: char| c == '-' || c == ':' || c == ',' || c.is_whitespace())
        .to_string()
}

/// A plausible pharmacy name has a letter and at least three characters.
pub fn is_valid_name(name: &str) -> bool {
    name.chars().count() >= 3 && name.chars().any(|c| c.is_alphabetic())
}

fn phone_regex() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:\+?\s*90[\s\-\.]*)?\(?\s*0?\s*[2-58]\d{2}\s*\)?[\s\-\.]*\d{3}[\s\-\.]*\d{2}[\s\-\.]*\d{2}",
        )
        .unwrap()
    })
}

/// Normalize a Turkish phone number to `0XXXXXXXXXX` (11 digits).
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        12 if digits.starts_with("90") => &digits[2..],
        11 if digits.starts_with('0') => &digits[1..],
        10 => digits.as_str(),
        _ => return None,
    };
    match national.chars().next() {
        Some('2' | '3' | '4' | '5' | '8') => Some(format!("0{national}")),
        _ => None,
    }
}

/// First Turkish phone number found in free text, normalized.
pub fn extract_phone(text: &str) -> Option<String> {
    phone_regex()
        .find_iter(text)
        .find_map(|m| normalize_phone(m.as_str()))
}

/// Address compare form: folded words only.
pub fn address_key(address: &str) -> String {
    fold_words(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_handles_dotted_and_dotless_i() {
        assert_eq!(fold_upper("Kadıköy"), "KADIKOY");
        assert_eq!(fold_upper("İSTANBUL"), "ISTANBUL");
        assert_eq!(fold_upper("şişli"), "SISLI");
        assert_eq!(fold_upper("i\u{0307}zmir"), "IZMIR");
    }

    #[test]
    fn pharmacy_key_strips_suffix_variants() {
        assert_eq!(pharmacy_key("AA ECZANESİ"), "AA");
        assert_eq!(pharmacy_key("Aa  Eczanesi"), "AA");
        assert_eq!(pharmacy_key("AA ECZ."), "AA");
        assert_eq!(pharmacy_key("Şifa Eczane"), "SIFA");
        // a bare suffix stays a key rather than vanishing
        assert_eq!(pharmacy_key("Eczane"), "ECZANE");
    }

    #[test]
    fn phone_shapes_normalize_to_eleven_digits() {
        assert_eq!(normalize_phone("(0216) 345 67 89").as_deref(), Some("02163456789"));
        assert_eq!(normalize_phone("+90 532 111 22 33").as_deref(), Some("05321112233"));
        assert_eq!(normalize_phone("216.345.67.89").as_deref(), Some("02163456789"));
        assert_eq!(normalize_phone("12345"), None);
        assert_eq!(normalize_phone("0116 345 67 89"), None);
    }

    #[test]
    fn phone_is_found_inside_text() {
        let t = "Tel: 0 (212) 555 44 33 - Fax yok";
        assert_eq!(extract_phone(t).as_deref(), Some("02125554433"));
        assert_eq!(extract_phone("Adres bilgisi yok"), None);
    }

    #[test]
    fn slug_and_title_case() {
        assert_eq!(slugify("Kadıköy"), "kadikoy");
        assert_eq!(slugify("  Şereflikoçhisar / Merkez "), "sereflikochisar-merkez");
        assert_eq!(title_case_tr("KADIKÖY"), "Kadıköy");
        assert_eq!(title_case_tr("İSTANBUL"), "İstanbul");
    }

    #[test]
    fn display_name_drops_numbering() {
        assert_eq!(clean_display_name("1. AA&nbsp;ECZANESİ"), "AA ECZANESİ");
        assert!(is_valid_name("AA ECZANESİ"));
        assert!(!is_valid_name("12"));
        assert!(!is_valid_name("123456"));
    }

    #[test]
    fn normalize_text_strips_markup() {
        assert_eq!(normalize_text("<b>Hello&nbsp;world</b>\n\t!"), "Hello world !");
    }
}
