//! Network access shared by the loader, adapters, and the script `fetch` capability.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use hyper::Request;
use tracing::debug;

use crate::error::{CapabilityError, CapabilityResult};
use crate::http_client::{HyperClient, build_https_client};

/// Outgoing request issued by a script, the loader, or an adapter.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl FetchRequest {
    /// Creates a `GET` request for the given URL.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Overrides the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request headers.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the request body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Response returned to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl FetchResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Appends a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the URL that produced this response.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the HTTP status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Returns the response headers.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the response body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Performs network requests on behalf of scripts and the loader.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Executes the request and returns the full response.
    async fn fetch(&self, request: FetchRequest) -> CapabilityResult<FetchResponse>;
}

/// Fetcher backed by a rustls-enabled hyper client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: HyperClient,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    /// Creates a fetcher with the bundled web PKI roots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: build_https_client(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> CapabilityResult<FetchResponse> {
        let url = request.url.clone();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(CapabilityError::fetch(url, "only http and https URLs can be fetched"));
        }

        let mut builder = Request::builder().method(request.method).uri(&url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_request = builder
            .body(hyper::Body::from(request.body))
            .map_err(|err| CapabilityError::fetch(&url, err.to_string()))?;

        debug!(url = %url, "issuing fetch");
        let response = self
            .client
            .request(http_request)
            .await
            .map_err(|err| CapabilityError::fetch(&url, err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| CapabilityError::fetch(&url, err.to_string()))?;

        Ok(FetchResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

/// In-memory fetcher serving canned responses, for hosts that bundle assets and for tests.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    responses: RwLock<HashMap<String, FetchResponse>>,
}

impl StaticFetcher {
    /// Creates an empty fetcher; every request answers 404.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` with status 200 for `url`.
    #[must_use]
    pub fn with_body(self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let url = url.into();
        let response = FetchResponse::new(url.clone(), 200, body);
        self.insert(url, response);
        self
    }

    /// Registers a full response for `url`.
    pub fn insert(&self, url: impl Into<String>, response: FetchResponse) {
        self.responses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), response);
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: FetchRequest) -> CapabilityResult<FetchResponse> {
        let responses = self.responses.read().unwrap_or_else(PoisonError::into_inner);
        Ok(responses
            .get(request.url())
            .cloned()
            .unwrap_or_else(|| FetchResponse::new(request.url(), 404, Bytes::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_fetcher_serves_registered_bodies() {
        let fetcher = StaticFetcher::new().with_body("https://assets.test/a.wasm", &b"\0asm"[..]);

        let hit = fetcher
            .fetch(FetchRequest::get("https://assets.test/a.wasm"))
            .await
            .unwrap();
        assert!(hit.is_success());
        assert_eq!(hit.body().as_ref(), b"\0asm");

        let miss = fetcher
            .fetch(FetchRequest::get("https://assets.test/b.wasm"))
            .await
            .unwrap();
        assert_eq!(miss.status(), 404);
    }

    #[tokio::test]
    async fn http_fetcher_rejects_other_schemes() {
        let fetcher = HttpFetcher::new();
        let err = fetcher
            .fetch(FetchRequest::get("file:///etc/passwd"))
            .await
            .expect_err("file scheme must be rejected");
        assert!(matches!(err, CapabilityError::Fetch { .. }));
    }
}
