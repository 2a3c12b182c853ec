//! Related-URL discovery for pages that parse to nothing: landing pages
//! that link or script-load the actual roster.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static RE_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:href|src|action|data-url|data-src)\s*=\s*(?:"([^"]+)"|'([^']+)')"#).unwrap()
});
static RE_SCRIPT_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:"((?:/|https?://)[^"\s]{3,200})"|'((?:/|https?://)[^'\s]{3,200})')"#).unwrap());

const DUTY_FRAGMENTS: &[&str] = &["nobet", "nöbet", "eczane", "pharmac", "duty"];
const SKIP_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".css", ".ico", ".woff", ".woff2", ".zip",
];

fn is_duty_related(candidate: &str) -> bool {
    let lower = candidate.to_lowercase();
    DUTY_FRAGMENTS.iter().any(|f| lower.contains(f))
}

fn is_skippable(candidate: &str) -> bool {
    let lower = candidate.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("javascript:")
        || lower.starts_with('#')
        || SKIP_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || path.ends_with(".js")
}

/// Duty-related URLs referenced by `html`, resolved against `base`, in
/// document order, without the base page itself.
pub fn candidates(html: &str, base: &str, limit: usize) -> Vec<String> {
    let Ok(base_url) = Url::parse(base) else {
        return Vec::new();
    };
    let raw = RE_ATTR
        .captures_iter(html)
        .chain(RE_SCRIPT_STRING.captures_iter(html))
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).map(|m| (m.start(), m.as_str())));
    let mut found: Vec<(usize, &str)> = raw.collect();
    found.sort_by_key(|(pos, _)| *pos);

    let mut out: Vec<String> = Vec::new();
    for (_, cand) in found {
        let cand = html_escape::decode_html_entities(cand.trim());
        if cand.is_empty() || is_skippable(&cand) || !is_duty_related(&cand) {
            continue;
        }
        let Ok(mut joined) = base_url.join(&cand) else {
            continue;
        };
        if !matches!(joined.scheme(), "http" | "https") {
            continue;
        }
        joined.set_fragment(None);
        let s = joined.to_string();
        if s == base_url.as_str() || out.contains(&s) {
            continue;
        }
        out.push(s);
        if out.len() >= limit {
            break;
        }
    }
    out
}
