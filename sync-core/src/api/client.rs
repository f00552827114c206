use super::{
    auth::{AuthManager, TokenScope},
    error::*,
    types::*,
};
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{ClientBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// HTTP verbs understood by the directory APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Patch,
    /// Legacy partial update verb still accepted by the Outlook REST API
    Merge,
    Delete,
}

impl ApiMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            ApiMethod::Get => reqwest::Method::GET,
            ApiMethod::Post => reqwest::Method::POST,
            ApiMethod::Patch => reqwest::Method::PATCH,
            ApiMethod::Merge => {
                reqwest::Method::from_bytes(b"MERGE").unwrap_or(reqwest::Method::PATCH)
            }
            ApiMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ApiMethod::Get => "GET",
            ApiMethod::Post => "POST",
            ApiMethod::Patch => "PATCH",
            ApiMethod::Merge => "MERGE",
            ApiMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Authenticated HTTP client for one directory API base URL
pub struct GraphHttpClient {
    /// Token source shared with the rest of the service
    pub auth: Arc<AuthManager>,

    http_client: reqwest::Client,

    /// Base URL every relative path is resolved against
    base_url: String,

    /// Sleep before every request to stay under the remote throttling limits
    pacing: Duration,

    /// Upper bound on time spent retrying throttled or failing requests
    max_retry_elapsed: Duration,
}

impl GraphHttpClient {
    pub fn new(base_url: impl Into<String>, auth: Arc<AuthManager>) -> Result<Self> {
        let http_client = ClientBuilder::new()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("o365-sync/0.1.0")
            .build()
            .map_err(GraphError::Network)?;

        Ok(Self::with_client(base_url, http_client, auth))
    }

    pub fn with_client(
        base_url: impl Into<String>,
        http_client: reqwest::Client,
        auth: Arc<AuthManager>,
    ) -> Self {
        Self {
            auth,
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pacing: Duration::from_millis(50),
            max_retry_elapsed: Duration::from_secs(60),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a path against the base URL; absolute URLs pass through
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Issue one request and return the raw response body
    ///
    /// Throttling, 5xx and network failures are retried here; everything else
    /// is returned to the caller, which decodes and validates the body.
    pub async fn call(
        &self,
        method: ApiMethod,
        path: &str,
        body: Option<&serde_json::Value>,
        scope: TokenScope,
    ) -> Result<String> {
        let url = self.url_for(path);
        self.retry_operation(|| self.send_once(method, &url, body, scope))
            .await
    }

    /// Issue a request and decode the JSON response body
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: ApiMethod,
        path: &str,
        body: Option<&serde_json::Value>,
        scope: TokenScope,
    ) -> Result<T> {
        let raw = self.call(method, path, body, scope).await?;
        serde_json::from_str(&raw).map_err(GraphError::Json)
    }

    /// Follow `nextLink` annotations and collect every item
    pub async fn get_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        scope: TokenScope,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(path.to_string());

        while let Some(url) = next {
            let page: ODataPage<T> = self.call_json(ApiMethod::Get, &url, None, scope).await?;
            items.extend(page.value);
            next = page.next_link;
        }

        Ok(items)
    }

    async fn send_once(
        &self,
        method: ApiMethod,
        url: &str,
        body: Option<&serde_json::Value>,
        scope: TokenScope,
    ) -> Result<String> {
        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }

        let token = self.auth.token_for(scope).await?;
        debug!("{} {}", method, url);

        let mut request = self
            .http_client
            .request(method.as_reqwest(), url)
            .bearer_auth(token)
            .header("Prefer", "outlook.timezone=\"UTC\"");

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.text().await?);
        }

        if status == StatusCode::UNAUTHORIZED {
            self.auth.invalidate(scope).await;
        }

        Err(Self::parse_error_response(response).await)
    }

    async fn parse_error_response(response: reqwest::Response) -> GraphError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return GraphError::RateLimit { retry_after };
        }

        let error_text = response.text().await.unwrap_or_default();

        if status == StatusCode::UNAUTHORIZED {
            return GraphError::Authentication(error_text);
        }

        match parse_error_body(&error_text) {
            Some((code, message)) => GraphError::Api {
                status: status.as_u16(),
                code,
                message,
            },
            None => GraphError::Api {
                status: status.as_u16(),
                code: String::new(),
                message: error_text,
            },
        }
    }

    async fn retry_operation<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(self.max_retry_elapsed),
            ..Default::default()
        };

        retry(backoff, || async {
            match operation().await {
                Ok(result) => Ok(result),
                Err(error) => {
                    if let Some(secs) = error.retry_after() {
                        warn!("Throttled by remote, retrying after {}s", secs);
                        Err(backoff::Error::retry_after(error, Duration::from_secs(secs)))
                    } else if error.is_retryable() {
                        warn!("Retryable error occurred: {}", error);
                        Err(backoff::Error::transient(error))
                    } else {
                        debug!("Non-retryable error: {}", error);
                        Err(backoff::Error::permanent(error))
                    }
                }
            }
        })
        .await
    }
}

// Builder pattern for client configuration
pub struct GraphHttpClientBuilder {
    base_url: String,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
    pacing: Option<Duration>,
    max_retry_elapsed: Option<Duration>,
}

impl GraphHttpClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: None,
            connect_timeout: None,
            user_agent: None,
            pacing: None,
            max_retry_elapsed: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    pub fn max_retry_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_retry_elapsed = Some(elapsed);
        self
    }

    pub fn build(self, auth: Arc<AuthManager>) -> Result<GraphHttpClient> {
        let mut client_builder = ClientBuilder::new();

        if let Some(timeout) = self.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        if let Some(connect_timeout) = self.connect_timeout {
            client_builder = client_builder.connect_timeout(connect_timeout);
        }

        if let Some(user_agent) = self.user_agent {
            client_builder = client_builder.user_agent(user_agent);
        }

        let http_client = client_builder.build().map_err(GraphError::Network)?;

        let mut client = GraphHttpClient::with_client(self.base_url, http_client, auth);
        if let Some(pacing) = self.pacing {
            client.pacing = pacing;
        }
        if let Some(elapsed) = self.max_retry_elapsed {
            client.max_retry_elapsed = elapsed;
        }
        Ok(client)
    }
}
