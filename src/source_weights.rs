//! # Authority Weights
//!
//! Maps a free-form source type ("İl Sağlık Müdürlüğü", "eczaci_odasi",
//! "Belediye") to a 0–100 trust prior used when an endpoint has no explicit
//! authority weight.
//!
//! - Case- and diacritic-insensitive lookup (Turkish letters fold to ASCII).
//! - Aliases map local spellings to canonical types.
//! - Fallback order: aliases → exact match → substring match → default.
//! - `default_seed()` carries the built-in ranking: health directorate >
//!   pharmacists' chamber > municipality > aggregator.

use serde::Deserialize;
use std::collections::HashMap;

use crate::normalize::fold_upper;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityWeights {
    /// Weight when nothing matches.
    #[serde(default = "default_default_weight")]
    pub default_weight: u8,
    /// Canonical source type → weight.
    #[serde(default)]
    pub weights: HashMap<String, u8>,
    /// Alternative spelling → canonical source type.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

fn default_default_weight() -> u8 {
    50
}

impl Default for AuthorityWeights {
    fn default() -> Self {
        Self::default_seed()
    }
}

impl AuthorityWeights {
    /// Weight for a source type label.
    pub fn weight_for(&self, source_type: &str) -> u8 {
        let s = normalize(source_type);
        if s.is_empty() {
            return clamp100(self.default_weight);
        }

        // 1) Alias resolution.
        if let Some((_, canon)) = self.aliases.iter().find(|(a, _)| normalize(a) == s) {
            if let Some(w) = self.exact(&normalize(canon)) {
                return w;
            }
        }

        // 2) Exact match.
        if let Some(w) = self.exact(&s) {
            return w;
        }

        // 3) Substring fallback, longest key first so "il saglik mudurlugu"
        // wins over a shorter overlapping key.
        let mut keys: Vec<(String, u8)> = self
            .weights
            .iter()
            .map(|(k, w)| (normalize(k), *w))
            .chain(self.aliases.iter().filter_map(|(a, c)| {
                self.exact(&normalize(c)).map(|w| (normalize(a), w))
            }))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        if let Some((_, w)) = keys.iter().find(|(k, _)| s.contains(k.as_str())) {
            return clamp100(*w);
        }

        // 4) Default.
        clamp100(self.default_weight)
    }

    fn exact(&self, normalized: &str) -> Option<u8> {
        self.weights
            .iter()
            .find(|(k, _)| normalize(k) == normalized)
            .map(|(_, w)| clamp100(*w))
    }

    /// Built-in ranking of Turkish duty-roster publishers.
    pub fn default_seed() -> Self {
        let mut weights = HashMap::new();
        let mut aliases = HashMap::new();

        for (k, v) in [
            ("health directorate", 90),
            ("chamber", 80),
            ("municipality", 65),
            ("aggregator", 50),
            ("static", 40),
        ] {
            weights.insert(k.to_string(), v);
        }

        for (a, c) in [
            ("il saglik mudurlugu", "health directorate"),
            ("saglik mudurlugu", "health directorate"),
            ("mudurluk", "health directorate"),
            ("directorate", "health directorate"),
            ("eczaci odasi", "chamber"),
            ("eczacilar odasi", "chamber"),
            ("oda", "chamber"),
            ("pharmacists chamber", "chamber"),
            ("buyuksehir belediyesi", "municipality"),
            ("belediye", "municipality"),
            ("municipal", "municipality"),
            ("portal", "aggregator"),
            ("news", "aggregator"),
            ("haber", "aggregator"),
            ("seed", "static"),
        ] {
            aliases.insert(a.to_string(), c.to_string());
        }

        Self {
            default_weight: default_default_weight(),
            weights,
            aliases,
        }
    }
}

/// Fold Turkish letters, lowercase, turn separators into single spaces.
fn normalize(s: &str) -> String {
    let mut out = fold_upper(s.trim()).to_ascii_lowercase();
    for ch in ['—', '–', '-', '_', '/', '\\', '.', ',', '\''] {
        out = out.replace(ch, " ");
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clamp100(x: u8) -> u8 {
    x.min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AuthorityWeights {
        AuthorityWeights::default_seed()
    }

    #[test]
    fn exact_match() {
        assert_eq!(cfg().weight_for("chamber"), 80);
        assert_eq!(cfg().weight_for("Health_Directorate"), 90);
    }

    #[test]
    fn turkish_aliases_resolve() {
        let c = cfg();
        assert_eq!(c.weight_for("İl Sağlık Müdürlüğü"), 90);
        assert_eq!(c.weight_for("ECZACI ODASI"), 80);
        assert_eq!(c.weight_for("Büyükşehir Belediyesi"), 65);
    }

    #[test]
    fn substring_match() {
        assert_eq!(cfg().weight_for("Ankara Eczacı Odası web"), 80);
    }

    #[test]
    fn default_weight_used() {
        let c = cfg();
        assert_eq!(c.weight_for("totally unknown"), c.default_weight);
        assert_eq!(c.weight_for(""), c.default_weight);
    }

    #[test]
    fn loaded_weights_are_clamped() {
        let c: AuthorityWeights = toml::from_str(
            r#"
default_weight = 30
[weights]
chamber = 250
"#,
        )
        .unwrap();
        assert_eq!(c.weight_for("chamber"), 100);
        assert_eq!(c.weight_for("belediye"), 30);
    }
}
