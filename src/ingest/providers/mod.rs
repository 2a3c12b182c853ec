//! Fetch adapters, one per acquisition flow.

pub mod discovery;
pub mod district_form;
pub mod generic;
pub mod http;
pub mod session_token;
pub mod static_seed;

use std::sync::Arc;

use crate::config::FetchConfig;
use crate::ingest::types::{AdapterSpec, SourceAdapter, SourceEndpoint};

pub use district_form::DistrictFormAdapter;
pub use generic::GenericAdapter;
pub use http::HttpClient;
pub use session_token::SessionTokenAdapter;
pub use static_seed::{fallback_endpoint, StaticSeedAdapter};

/// Picks the adapter for an endpoint. Tests swap in scripted adapters here.
pub trait AdapterResolver: Send + Sync {
    fn resolve(&self, endpoint: &SourceEndpoint) -> Arc<dyn SourceAdapter>;
    /// Adapter serving static fallback endpoints.
    fn fallback(&self) -> Arc<dyn SourceAdapter>;
}

/// Real network adapters sharing one HTTP client.
pub struct HttpAdapters {
    generic: Arc<GenericAdapter>,
    session_token: Arc<SessionTokenAdapter>,
    district_form: Arc<DistrictFormAdapter>,
    fallback: Arc<StaticSeedAdapter>,
}

impl HttpAdapters {
    pub fn new(cfg: &FetchConfig) -> Self {
        let http = HttpClient::new(cfg);
        Self {
            generic: Arc::new(GenericAdapter::new(http.clone())),
            session_token: Arc::new(SessionTokenAdapter::new(http.clone())),
            district_form: Arc::new(DistrictFormAdapter::new(http)),
            fallback: Arc::new(StaticSeedAdapter),
        }
    }
}

impl AdapterResolver for HttpAdapters {
    fn resolve(&self, endpoint: &SourceEndpoint) -> Arc<dyn SourceAdapter> {
        match endpoint.adapter {
            AdapterSpec::Generic => self.generic.clone(),
            AdapterSpec::SessionToken { .. } => self.session_token.clone(),
            AdapterSpec::DistrictForm { .. } => self.district_form.clone(),
        }
    }

    fn fallback(&self) -> Arc<dyn SourceAdapter> {
        self.fallback.clone()
    }
}
