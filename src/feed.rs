// ABOUTME: Feed Client - paginated retrieval from the listing feed's OData-style API
// ABOUTME: Defines the FeedClient trait consumed by the engine and its reqwest impl

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::mapper::RawRecord;

/// One page request against a feed resource.
///
/// `order_by`/`filter` are feed query expressions; pagination within one
/// run must be stable for a fixed filter and order.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub order_by: String,
    pub top: usize,
    pub skip: usize,
    pub filter: Option<String>,
}

/// Feed operations the sync engine depends on.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch one page of raw records. May fail transiently; the engine
    /// treats a failure as one lost page, never a lost run.
    async fn fetch_page(&self, resource: &str, request: &PageRequest) -> Result<Vec<RawRecord>>;

    /// Total record count for a resource and filter.
    async fn count(&self, resource: &str, filter: Option<&str>) -> Result<u64>;
}

/// HTTP feed client speaking the feed's OData dialect.
pub struct HttpFeedClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFeedClient {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Issue one GET with a small bounded transport retry. This is the only
    /// automatic retry anywhere in the system; everything above it prefers
    /// forward progress over completeness.
    async fn get_json(&self, url: Url) -> Result<Value> {
        let mut delay = Duration::from_secs(1);
        let mut last_err = None;

        for attempt in 1..=3u32 {
            let mut request = self.client.get(url.clone());
            if let Some(ref token) = self.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .context("Failed to parse feed response body");
                }
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(
                        "Feed returned {} on attempt {}: {}",
                        status,
                        attempt,
                        body
                    );
                    last_err = Some(anyhow::anyhow!("feed returned {}: {}", status, body));
                }
                Ok(response) => {
                    // Client errors are not transient; do not retry.
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("feed request failed with {}: {}", status, body);
                }
                Err(e) => {
                    tracing::warn!("Feed request attempt {} failed: {}", attempt, e);
                    last_err = Some(e.into());
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        match last_err {
            Some(e) => Err(e).context("Feed unreachable after 3 attempts"),
            None => anyhow::bail!("Feed unreachable"),
        }
    }

    fn resource_url(&self, resource: &str, request: Option<&PageRequest>) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{}", self.base_url, resource))
            .with_context(|| format!("Invalid feed URL for resource '{}'", resource))?;
        if let Some(req) = request {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$orderby", &req.order_by);
            pairs.append_pair("$top", &req.top.to_string());
            if req.skip > 0 {
                pairs.append_pair("$skip", &req.skip.to_string());
            }
            if let Some(ref filter) = req.filter {
                pairs.append_pair("$filter", filter);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch_page(&self, resource: &str, request: &PageRequest) -> Result<Vec<RawRecord>> {
        let url = self.resource_url(resource, Some(request))?;
        let body = self.get_json(url).await?;

        let records = body
            .get("value")
            .and_then(Value::as_array)
            .context("Feed response missing 'value' array")?
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();

        Ok(records)
    }

    async fn count(&self, resource: &str, filter: Option<&str>) -> Result<u64> {
        let mut url = self.resource_url(resource, None)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$count", "true");
            pairs.append_pair("$top", "0");
            if let Some(f) = filter {
                pairs.append_pair("$filter", f);
            }
        }
        let body = self.get_json(url).await?;

        body.get("@odata.count")
            .and_then(Value::as_u64)
            .context("Feed response missing '@odata.count'")
    }
}
