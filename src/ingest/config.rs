// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::{AdapterSpec, PayloadFormat, SourceEndpoint, SourceRole};
use crate::parse::{ParsedRow, ParserKey};
use crate::source_weights::AuthorityWeights;

const ENV_PATH: &str = "DUTY_ENDPOINTS_PATH";

const BUILTIN_ENDPOINTS: &str = include_str!("../../config/endpoints.toml");
const BUILTIN_SEEDS: &str = include_str!("../../config/seeds.toml");

#[derive(Debug, Deserialize)]
struct EndpointFile {
    #[serde(default, rename = "endpoint")]
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    province_slug: String,
    source_name: String,
    #[serde(default)]
    source_type: String,
    #[serde(default)]
    authority_weight: Option<u8>,
    url: String,
    #[serde(default)]
    format: PayloadFormat,
    #[serde(default)]
    parser_key: Option<ParserKey>,
    role: SourceRole,
    #[serde(default)]
    adapter: AdapterSpec,
    #[serde(default)]
    strict_date: bool,
    #[serde(default)]
    date_selectors: Vec<String>,
    #[serde(default = "enabled_default")]
    enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// Parse an endpoint list (TOML `[[endpoint]]` tables). Missing weights are
/// filled from the source type.
pub fn parse_endpoints(s: &str, weights: &AuthorityWeights) -> Result<Vec<SourceEndpoint>> {
    let file: EndpointFile = toml::from_str(s).context("parsing endpoint list")?;
    let mut out = Vec::with_capacity(file.endpoints.len());
    for e in file.endpoints.into_iter().filter(|e| e.enabled) {
        let slug = e.province_slug.trim().to_ascii_lowercase();
        if crate::provinces::find(&slug).is_none() {
            return Err(anyhow!("unknown province '{}' in endpoint '{}'", slug, e.source_name));
        }
        if e.url.trim().is_empty() {
            return Err(anyhow!("endpoint '{}' has an empty url", e.source_name));
        }
        let authority_weight = e
            .authority_weight
            .unwrap_or_else(|| weights.weight_for(&e.source_type))
            .min(100);
        out.push(SourceEndpoint {
            id: 0,
            province_slug: slug,
            source_name: e.source_name,
            source_type: e.source_type,
            authority_weight,
            url: e.url,
            format: e.format,
            parser_key: e.parser_key,
            role: e.role,
            adapter: e.adapter,
            strict_date: e.strict_date,
            date_selectors: e.date_selectors,
        });
    }
    Ok(out)
}

/// Load the endpoint list from an explicit path.
pub fn load_endpoints_from(path: &Path, weights: &AuthorityWeights) -> Result<Vec<SourceEndpoint>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading endpoints from {}", path.display()))?;
    parse_endpoints(&content, weights)
}

/// Load endpoints using env var + fallbacks:
/// 1) $DUTY_ENDPOINTS_PATH
/// 2) config/endpoints.toml
/// 3) the copy embedded at build time
pub fn load_endpoints_default(weights: &AuthorityWeights) -> Result<Vec<SourceEndpoint>> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_endpoints_from(&pb, weights);
        } else {
            return Err(anyhow!("DUTY_ENDPOINTS_PATH points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/endpoints.toml");
    if toml_p.exists() {
        return load_endpoints_from(&toml_p, weights);
    }
    parse_endpoints(BUILTIN_ENDPOINTS, weights)
}

/// Built-in endpoints of one province; empty when the list cannot be read.
pub fn builtin_endpoints_for(province_slug: &str, weights: &AuthorityWeights) -> Vec<SourceEndpoint> {
    match load_endpoints_default(weights) {
        Ok(all) => all
            .into_iter()
            .filter(|e| e.province_slug == province_slug)
            .collect(),
        Err(e) => {
            tracing::warn!(target: "ingest", error = %e, "built-in endpoint list unavailable");
            Vec::new()
        }
    }
}

/// Province slugs the built-in list covers, sorted and deduplicated.
pub fn builtin_province_slugs(weights: &AuthorityWeights) -> Vec<String> {
    let mut slugs: Vec<String> = load_endpoints_default(weights)
        .map(|all| all.into_iter().map(|e| e.province_slug).collect())
        .unwrap_or_default();
    slugs.sort();
    slugs.dedup();
    slugs
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default, rename = "seed")]
    seeds: Vec<SeedEntry>,
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    province_slug: String,
    #[serde(default)]
    district: String,
    name: String,
    #[serde(default)]
    address: String,
    phone: String,
}

/// Static fallback rows for a province.
pub fn seed_rows(province_slug: &str) -> Vec<ParsedRow> {
    let file: SeedFile = match toml::from_str(BUILTIN_SEEDS) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(target: "ingest", error = %e, "seed list unreadable");
            return Vec::new();
        }
    };
    file.seeds
        .into_iter()
        .filter(|s| s.province_slug == province_slug)
        .map(|s| ParsedRow {
            district_name: s.district,
            pharmacy_name: s.name,
            address: s.address,
            phone: s.phone,
            lat: None,
            lng: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    #[test]
    fn embedded_lists_parse() {
        let eps = parse_endpoints(BUILTIN_ENDPOINTS, &AuthorityWeights::default()).unwrap();
        assert!(eps.iter().any(|e| e.province_slug == "istanbul" && e.role == SourceRole::Primary));
        let ist = eps.iter().find(|e| e.source_name == "İstanbul Eczacı Odası").unwrap();
        assert_eq!(ist.authority_weight, 80);
        assert!(matches!(ist.adapter, AdapterSpec::SessionToken { .. }));
        let izmir_api = eps.iter().find(|e| e.format == PayloadFormat::Json).unwrap();
        assert_eq!(izmir_api.authority_weight, 65);
        assert!(!seed_rows("istanbul").is_empty());
        assert!(seed_rows("rize").is_empty());
    }

    #[test]
    fn explicit_weight_and_disabled_entries() {
        let s = r#"
[[endpoint]]
province_slug = "Rize"
source_name = "Rize Eczacı Odası"
authority_weight = 77
url = "https://example.org/rize"
role = "primary"

[[endpoint]]
province_slug = "rize"
source_name = "Eski kaynak"
url = "https://example.org/old"
role = "secondary"
enabled = false
"#;
        let eps = parse_endpoints(s, &AuthorityWeights::default()).unwrap();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].province_slug, "rize");
        assert_eq!(eps[0].authority_weight, 77);
        assert_eq!(eps[0].adapter, AdapterSpec::Generic);
    }

    #[test]
    fn unknown_province_is_rejected() {
        let s = r#"
[[endpoint]]
province_slug = "atlantis"
source_name = "x"
url = "https://example.org"
role = "primary"
"#;
        assert!(parse_endpoints(s, &AuthorityWeights::default()).is_err());
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_PATH);

        // No file in the temp CWD: embedded list.
        let v = load_endpoints_default(&AuthorityWeights::default()).unwrap();
        assert!(v.len() >= 6);

        let p = tmp.path().join("eps.toml");
        fs::write(
            &p,
            "[[endpoint]]\nprovince_slug = \"rize\"\nsource_name = \"R\"\nurl = \"https://r\"\nrole = \"primary\"\n",
        )
        .unwrap();
        env::set_var(ENV_PATH, p.display().to_string());
        let v2 = load_endpoints_default(&AuthorityWeights::default()).unwrap();
        assert_eq!(v2.len(), 1);

        env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(load_endpoints_default(&AuthorityWeights::default()).is_err());
        env::remove_var(ENV_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
