//! Async HTTP client wrapping reqwest.
//!
//! Browser-like headers, a hard per-request timeout (the transport aborts
//! the request, not just the wait), conditional GET support and url-encoded
//! POSTs for the multi-step flows. Non-2xx answers other than `304` become
//! [`IngestError::Fetch`].

use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};

use crate::config::{FetchConfig, MAX_FETCH_TIMEOUT_SECS, MIN_FETCH_TIMEOUT_SECS};
use crate::error::{IngestError, IngestResult};
use crate::ingest::types::ConditionalHeaders;

/// Response of one request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn not_modified(&self) -> bool {
        self.status == 304
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    cfg: FetchConfig,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(cfg: &FetchConfig) -> Self {
        let secs = cfg
            .timeout_secs
            .clamp(MIN_FETCH_TIMEOUT_SECS, MAX_FETCH_TIMEOUT_SECS);
        let timeout = Duration::from_secs(secs);
        Self {
            client: build_client(cfg, timeout),
            cfg: cfg.clone(),
            timeout,
        }
    }

    /// A client with its own cookie jar, for flows that need a session.
    pub fn session(&self) -> Self {
        Self {
            client: build_client(&self.cfg, self.timeout),
            cfg: self.cfg.clone(),
            timeout: self.timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn discovery_limit(&self) -> usize {
        self.cfg.discovery_limit
    }

    /// GET, sending validators when present.
    pub async fn get(&self, url: &str, conditional: &ConditionalHeaders) -> IngestResult<HttpResponse> {
        let mut req = self.client.get(url).timeout(self.timeout);
        if let Some(etag) = &conditional.etag {
            req = req.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(lm) = &conditional.last_modified {
            req = req.header(IF_MODIFIED_SINCE, lm.as_str());
        }
        let resp = req.send().await.map_err(|e| transport_error(url, &e))?;
        read_response(url, resp).await
    }

    /// POST url-encoded form fields.
    pub async fn post_form(
        &self,
        url: &str,
        form_fields: &[(String, String)],
        extra_headers: &[(String, String)],
    ) -> IngestResult<HttpResponse> {
        let mut builder = self.client.post(url).timeout(self.timeout);
        for (name, value) in extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder
            .form(form_fields)
            .send()
            .await
            .map_err(|e| transport_error(url, &e))?;
        read_response(url, resp).await
    }
}

fn build_client(cfg: &FetchConfig, timeout: Duration) -> reqwest::Client {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
    );
    if let Ok(v) = HeaderValue::from_str(&cfg.accept_language) {
        headers.insert(ACCEPT_LANGUAGE, v);
    }
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent(cfg.user_agent.as_str())
        .default_headers(headers)
        .cookie_store(true)
        .build()
        .unwrap_or_default()
}

fn transport_error(url: &str, e: &reqwest::Error) -> IngestError {
    let reason = if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_connect() {
        format!("connect failed: {e}")
    } else {
        e.to_string()
    };
    IngestError::fetch(url, None, reason)
}

async fn read_response(url: &str, r: reqwest::Response) -> IngestResult<HttpResponse> {
    let status = r.status().as_u16();
    let final_url = r.url().to_string();
    let header = |name: HeaderName| {
        r.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let etag = header(ETAG);
    let last_modified = header(LAST_MODIFIED);

    if status != 304 && !r.status().is_success() {
        return Err(IngestError::fetch(url, Some(status), format!("HTTP {status}")));
    }

    let body = if status == 304 {
        String::new()
    } else {
        r.text().await.map_err(|e| transport_error(url, &e))?
    };

    Ok(HttpResponse {
        url: url.to_string(),
        final_url,
        status,
        etag,
        last_modified,
        body,
    })
}
