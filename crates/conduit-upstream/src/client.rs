//! HTTP client that enforces the URL policy on every hop

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use conduit_config::{ProxyEntry, UpstreamConfig};
use dashmap::DashMap;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::UpstreamError;
use crate::policy::UrlPolicy;
use crate::proxy::{ProxyPool, StaticProxyPool};

/// Request about to be sent upstream
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn get(url: Url, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            url,
            headers,
            body: None,
        }
    }

    pub fn post_json(url: Url, mut headers: HeaderMap, body: &serde_json::Value) -> Result<Self, UpstreamError> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| UpstreamError::InvalidResponse(format!("unserializable body: {e}")))?;
        headers.insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));

        Ok(Self {
            method: Method::POST,
            url,
            headers,
            body: Some(Bytes::from(bytes)),
        })
    }
}

/// Outbound client with manual redirects, proxy failover and size caps
pub struct SafeClient {
    direct: reqwest::Client,
    proxied: DashMap<String, reqwest::Client>,
    proxies: Arc<dyn ProxyPool>,
    policy: UrlPolicy,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_redirects: u32,
    max_response_bytes: u64,
    max_proxy_attempts: u32,
}

impl SafeClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let direct = build_client(config.connect_timeout, None)?;

        Ok(Self {
            direct,
            proxied: DashMap::new(),
            proxies: Arc::new(StaticProxyPool::new(config.proxies.clone())),
            policy: UrlPolicy::new(&config.url_policy),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            max_redirects: config.max_redirects,
            max_response_bytes: config.max_response_bytes,
            max_proxy_attempts: config.max_proxy_attempts,
        })
    }

    /// Replace the configured proxy list with another pool
    #[must_use]
    pub fn with_proxy_pool(mut self, pool: Arc<dyn ProxyPool>) -> Self {
        self.proxies = pool;
        self
    }

    pub const fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send a request, waiting at most the request timeout for response headers
    ///
    /// The first attempt goes direct. Transient network failures are retried
    /// through proxies from the pool, each proxy at most once.
    pub async fn send(&self, request: &OutboundRequest) -> Result<reqwest::Response, UpstreamError> {
        let mut tried: Vec<String> = Vec::new();
        let mut proxy: Option<ProxyEntry> = None;
        let mut proxy_attempts = 0u32;

        loop {
            let error = match self.send_via(request, proxy.as_ref()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !error.is_transient() || proxy_attempts >= self.max_proxy_attempts {
                return Err(error);
            }
            if let Some(failed) = proxy.take() {
                tried.push(failed.id);
            }
            let Some(next) = self.proxies.next_proxy(&tried).await else {
                return Err(error);
            };

            tracing::warn!(
                url = %request.url,
                proxy = %next.id,
                error = %error,
                "upstream unreachable, retrying through proxy"
            );
            proxy_attempts += 1;
            proxy = Some(next);
        }
    }

    async fn send_via(
        &self,
        request: &OutboundRequest,
        proxy: Option<&ProxyEntry>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let client = match proxy {
            None => self.direct.clone(),
            Some(entry) => self.proxy_client(entry)?,
        };

        tokio::time::timeout(self.request_timeout, self.follow_redirects(&client, request))
            .await
            .map_err(|_| {
                UpstreamError::Timeout(format!("no response from {} within {:?}", request.url, self.request_timeout))
            })?
    }

    fn proxy_client(&self, entry: &ProxyEntry) -> Result<reqwest::Client, UpstreamError> {
        if let Some(client) = self.proxied.get(&entry.id) {
            return Ok(client.clone());
        }

        let client = build_client(self.connect_timeout, Some(entry))?;
        self.proxied.insert(entry.id.clone(), client.clone());
        Ok(client)
    }

    async fn follow_redirects(
        &self,
        client: &reqwest::Client,
        request: &OutboundRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut method = request.method.clone();
        let mut url = request.url.clone();
        let mut headers = request.headers.clone();
        let mut body = request.body.clone();

        for _ in 0..=self.max_redirects {
            self.policy.check(&url).await?;

            let mut builder = client.request(method.clone(), url.clone()).headers(headers.clone());
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }
            let response = builder.send().await?;

            let status = response.status();
            if !status.is_redirection() {
                return Ok(response);
            }
            let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
                return Ok(response);
            };
            let next = url
                .join(location)
                .map_err(|e| UpstreamError::InvalidResponse(format!("bad redirect location {location}: {e}")))?;

            let downgrade = status == StatusCode::SEE_OTHER
                || (method == Method::POST && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND));
            if downgrade {
                method = Method::GET;
                body = None;
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
            }
            if next.origin() != url.origin() {
                strip_credentials(&mut headers);
            }

            tracing::debug!(from = %url, to = %next, status = status.as_u16(), "following redirect");
            url = next;
        }

        Err(UpstreamError::TooManyRedirects(self.max_redirects))
    }

    /// Read a whole body, failing once it exceeds the configured cap
    pub async fn read_body(&self, mut response: reqwest::Response) -> Result<Bytes, UpstreamError> {
        let limit = self.max_response_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(UpstreamError::ResponseTooLarge(limit));
        }

        let read = async {
            let mut buf = BytesMut::new();
            while let Some(chunk) = response.chunk().await? {
                if u64::try_from(buf.len() + chunk.len()).unwrap_or(u64::MAX) > limit {
                    return Err(UpstreamError::ResponseTooLarge(limit));
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(buf.freeze())
        };

        tokio::time::timeout(self.request_timeout, read)
            .await
            .map_err(|_| UpstreamError::Timeout("response body not received in time".to_string()))?
    }
}

impl std::fmt::Debug for SafeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeClient")
            .field("policy", &self.policy)
            .field("request_timeout", &self.request_timeout)
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

fn build_client(connect_timeout: Duration, proxy: Option<&ProxyEntry>) -> Result<reqwest::Client, UpstreamError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none());

    builder = match proxy {
        Some(entry) => builder.proxy(
            reqwest::Proxy::all(entry.url.as_str())
                .map_err(|e| UpstreamError::Network(format!("invalid proxy {}: {e}", entry.id)))?,
        ),
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| UpstreamError::Network(format!("failed to build HTTP client: {e}")))
}

/// Drop credentials before following a redirect to another origin
fn strip_credentials(headers: &mut HeaderMap) {
    let sensitive: Vec<HeaderName> = headers
        .iter()
        .filter(|(_, value)| value.is_sensitive())
        .map(|(name, _)| name.clone())
        .collect();
    for name in sensitive {
        headers.remove(name);
    }
    headers.remove(AUTHORIZATION);
    headers.remove(COOKIE);
}
