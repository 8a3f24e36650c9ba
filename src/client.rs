//! Outbound HTTP client that carries the request id.
//!
//! A [`TraceClient`] stamps every outgoing request with a `User-Agent` (the
//! service name by default) and the `x-request-id` header, so a call chain
//! across services can be followed through their logs. The id comes from a
//! function supplied by the caller; the client does not know where it lives.
//! Usually it is the id the [`RequestId`](crate::middleware::request_id::RequestId)
//! middleware stored in the inbound request's context:
//!
//! ```rust,no_run
//! use svckit::{Request, TraceClient};
//! use svckit::middleware::request_id;
//!
//! async fn checkout(req: Request) -> String {
//!     let id = request_id::get(req.context()).unwrap_or_default();
//!     let client = TraceClient::new(move || id.clone());
//!     match client.get("http://inventory.internal/stock/42").await {
//!         Ok(res) => res.status().to_string(),
//!         Err(e) => e.to_string(),
//!     }
//! }
//! ```
//!
//! Failed attempts are retried with linear backoff: three attempts by
//! default, waiting `backoff`, then `2 × backoff`, between them. Transport
//! errors and `5xx` responses count as failures. Once attempts run out a
//! transport error is returned as [`Error::Request`]; a final `5xx` response
//! is returned as-is for the caller to inspect.

use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_TYPE, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Response};
use serde::Serialize;

use crate::env;
use crate::error::Error;
use crate::middleware::request_id;

/// How often, and how patiently, failed requests are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` is treated as `1`.
    pub max_attempts: u32,
    /// Base delay; the wait after attempt `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self { max_attempts, backoff }
    }

    /// A single attempt, no retries.
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

type RequestIdFn = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct TraceClient {
    request_id: RequestIdFn,
    user_agent: String,
    retry: RetryPolicy,
    client: Client,
}

impl TraceClient {
    /// A client with the default retry policy whose `User-Agent` is the
    /// `SERVICE_NAME` environment variable. Use
    /// [`Service::trace_client`](crate::Service::trace_client) to take the
    /// name configured on a service instead.
    pub fn new(request_id: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self::with_client(request_id, Client::new())
    }

    /// Wraps an existing `reqwest` client (custom TLS, proxies, pools).
    pub fn with_client(
        request_id: impl Fn() -> String + Send + Sync + 'static,
        client: Client,
    ) -> Self {
        Self {
            request_id: Arc::new(request_id),
            user_agent: env::service_name(),
            retry: RetryPolicy::default(),
            client,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn set_user_agent(&mut self, agent: impl Into<String>) {
        self.user_agent = agent.into();
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn get(&self, url: &str) -> Result<Response, Error> {
        self.execute(self.client.request(Method::GET, url).build()?).await
    }

    pub async fn head(&self, url: &str) -> Result<Response, Error> {
        self.execute(self.client.request(Method::HEAD, url).build()?).await
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<reqwest::Body>,
    ) -> Result<Response, Error> {
        let req = self
            .client
            .request(Method::POST, url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .build()?;
        self.execute(req).await
    }

    /// POSTs `form` as `application/x-www-form-urlencoded`.
    pub async fn post_form<T: Serialize + ?Sized>(&self, url: &str, form: &T) -> Result<Response, Error> {
        let body = serde_urlencoded::to_string(form)?;
        self.post(url, "application/x-www-form-urlencoded", body).await
    }

    /// Sends `req` with the tracing headers and the retry policy applied.
    ///
    /// Requests with a streaming body cannot be replayed and are sent once.
    pub async fn execute(&self, mut req: reqwest::Request) -> Result<Response, Error> {
        self.stamp(&mut req);

        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let replay = if attempt < attempts { req.try_clone() } else { None };
            let outcome = self.client.execute(req).await;

            let Some(next) = replay else {
                return outcome.map_err(Error::from);
            };
            match outcome {
                Ok(res) if !res.status().is_server_error() => return Ok(res),
                Ok(res) => {
                    tracing::warn!(status = %res.status(), attempt, "outbound request failed, retrying");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "outbound request failed, retrying");
                }
            }

            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
            req = next;
        }
    }

    fn stamp(&self, req: &mut reqwest::Request) {
        let headers = req.headers_mut();
        match HeaderValue::try_from(self.user_agent.as_str()) {
            Ok(agent) => {
                headers.insert(USER_AGENT, agent);
            }
            Err(_) => tracing::warn!(user_agent = %self.user_agent, "user agent is not a valid header value"),
        }
        request_id::set_header(headers, &(self.request_id)());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }

    #[test]
    fn stamps_tracing_headers() {
        let mut client = TraceClient::new(|| "req-1".to_owned());
        client.set_user_agent("orders");
        let mut req = client.client.get("http://localhost/").build().unwrap();
        client.stamp(&mut req);

        assert_eq!(req.headers()[USER_AGENT], "orders");
        assert_eq!(req.headers()[request_id::HEADER], "req-1");
    }
}
