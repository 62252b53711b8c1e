//! Network side of the offline cache.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use super::{ResourceResponse, ResponseOrigin};

/// Per-resource request timeout in seconds. Cache installs fetch many small
/// static assets; anything slower than this is better retried on the next
/// install.
const FETCH_TIMEOUT_SECS: u64 = 30;

/// Fetches a resource over the network.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ResourceResponse>;
}

/// reqwest-backed fetcher. Classifies each response as same-origin or
/// cross-origin against the configured application origin; only same-origin
/// success responses are eligible for caching.
pub struct HttpFetcher {
    client: Client,
    app_origin: Url,
}

impl HttpFetcher {
    pub fn new(app_origin: &str) -> Result<Self> {
        let app_origin = Url::parse(app_origin)
            .with_context(|| format!("Invalid application origin: {app_origin}"))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, app_origin })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ResourceResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;

        // The final URL after redirects decides the origin, not the request.
        let origin = if response.url().origin() == self.app_origin.origin() {
            ResponseOrigin::Basic
        } else {
            ResponseOrigin::Cross
        };
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {url}"))?
            .to_vec();

        debug!(%url, status, ?origin, bytes = body.len(), "resource fetched");
        Ok(ResourceResponse {
            status,
            origin,
            content_type,
            body,
        })
    }
}
