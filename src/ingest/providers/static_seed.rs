//! Last-resort adapter serving the embedded seed roster of a province.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{IngestError, IngestResult};
use crate::ingest::build_batch;
use crate::ingest::config::seed_rows;
use crate::ingest::types::{
    AdapterSpec, ConditionalHeaders, FetchContext, FetchOutcome, PayloadFormat, SourceAdapter, SourceEndpoint,
};
use crate::parse::sanitize_rows;

/// Weight taken off the endpoint a fallback stands in for.
pub const FALLBACK_WEIGHT_PENALTY: u8 = 20;
pub const FALLBACK_WEIGHT_FLOOR: u8 = 25;

/// Endpoint describing the static fallback for `template`'s role.
pub fn fallback_endpoint(template: &SourceEndpoint) -> SourceEndpoint {
    SourceEndpoint {
        id: 0,
        province_slug: template.province_slug.clone(),
        source_name: format!("{} (static fallback)", template.source_name),
        source_type: "static".to_string(),
        authority_weight: template
            .authority_weight
            .saturating_sub(FALLBACK_WEIGHT_PENALTY)
            .max(FALLBACK_WEIGHT_FLOOR),
        url: format!("static://{}/{}", template.province_slug, template.role.as_str()),
        format: PayloadFormat::Auto,
        parser_key: None,
        role: template.role,
        adapter: AdapterSpec::Generic,
        strict_date: false,
        date_selectors: Vec::new(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StaticSeedAdapter;

#[async_trait]
impl SourceAdapter for StaticSeedAdapter {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        _conditional: &ConditionalHeaders,
        ctx: &FetchContext,
    ) -> IngestResult<FetchOutcome> {
        let rows = sanitize_rows(seed_rows(&endpoint.province_slug));
        if rows.is_empty() {
            return Err(IngestError::parse(&endpoint.source_name));
        }
        let batch = build_batch(endpoint, rows, ctx, Utc::now());
        Ok(FetchOutcome {
            batch: Some(batch),
            http_status: 200,
            etag: None,
            last_modified: None,
            raw_payload: String::new(),
            warnings: vec!["served from static seed".to_string()],
        })
    }

    fn name(&self) -> &'static str {
        "static_seed"
    }
}
