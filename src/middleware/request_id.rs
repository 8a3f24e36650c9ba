//! Request-id propagation.
//!
//! Every request gets a correlation id. If the client (or an upstream
//! service) sent one in `x-request-id` it is reused verbatim, otherwise a
//! new one is generated (UUID v4 by default). The id is stored in the
//! request [`Context`](crate::Context) under `request_id` before the next
//! link runs and is echoed in the response header on the way out. Pass it to
//! a [`TraceClient`](crate::TraceClient) to carry it into outbound calls.
//!
//! Both the header name and the context key are configurable:
//!
//! ```rust
//! use svckit::middleware::request_id::RequestId;
//!
//! let mw = RequestId::new()
//!     .header("x-correlation-id")
//!     .context_key("correlation_id")
//!     .with_generator(|| "fixed-for-tests".to_owned());
//! ```

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use uuid::Uuid;

use crate::context::Context;
use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;

/// Default header carrying the id, inbound and outbound.
pub const HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Default context key the id is stored under.
pub const CONTEXT_KEY: &str = "request_id";

type Generator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct RequestId {
    header: HeaderName,
    context_key: Arc<str>,
    generator: Generator,
}

impl RequestId {
    pub fn new() -> Self {
        Self {
            header: HEADER,
            context_key: Arc::from(CONTEXT_KEY),
            generator: Arc::new(generate_uuid),
        }
    }

    /// Uses `name` instead of `x-request-id`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid header name.
    pub fn header(mut self, name: &str) -> Self {
        self.header = HeaderName::try_from(name)
            .unwrap_or_else(|e| panic!("invalid request-id header `{name}`: {e}"));
        self
    }

    pub fn context_key(mut self, key: &str) -> Self {
        self.context_key = Arc::from(key);
        self
    }

    /// Replaces the UUID generator, e.g. with a deterministic one in tests.
    pub fn with_generator(mut self, generator: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    /// Reads the id this middleware stored in `ctx`.
    pub fn id_from(&self, ctx: &Context) -> Option<String> {
        ctx.get_str(&self.context_key).map(str::to_owned)
    }

    fn get_or_generate(&self, req: &Request) -> String {
        req.headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| (self.generator)())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for RequestId {
    fn call(&self, mut req: Request, next: Next) -> BoxFuture {
        let id = self.get_or_generate(&req);
        req.context_mut().set(self.context_key.as_ref(), id.as_str());
        let header = self.header.clone();

        Box::pin(async move {
            let mut res = next.run(req).await;
            match HeaderValue::try_from(id.as_str()) {
                Ok(value) => {
                    res.headers_mut().insert(header, value);
                }
                Err(_) => tracing::warn!(request_id = %id, "request id is not a valid header value"),
            }
            res
        })
    }
}

/// Reads the id stored under the default context key.
pub fn get(ctx: &Context) -> Option<String> {
    ctx.get_str(CONTEXT_KEY).map(str::to_owned)
}

/// Stamps `headers` with `id` under the default header name.
///
/// Ids that are not valid header values are skipped.
pub fn set_header(headers: &mut HeaderMap, id: &str) {
    if let Ok(value) = HeaderValue::try_from(id) {
        headers.insert(HEADER, value);
    }
}

fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::context::ContextInit;
    use crate::{Router, Service};

    async fn show_id(req: Request) -> String {
        get(req.context()).unwrap_or_default()
    }

    fn service() -> Service {
        Service::new(Router::new().get("/", show_id))
            .with(ContextInit)
            .with(RequestId::new())
    }

    #[tokio::test]
    async fn generates_an_id_when_absent() {
        let res = service()
            .handle(http::Request::get("/").body(String::new()).unwrap())
            .await;
        let id = res.headers()[HEADER].to_str().unwrap().to_owned();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(res.body_text(), id);
    }

    #[tokio::test]
    async fn echoes_an_existing_id() {
        let res = service()
            .handle(
                http::Request::get("/")
                    .header("X-Request-Id", "existing-request-id")
                    .body(String::new())
                    .unwrap(),
            )
            .await;
        assert_eq!(res.headers()[HEADER], "existing-request-id");
        assert_eq!(res.body_text(), "existing-request-id");
    }

    #[tokio::test]
    async fn empty_header_counts_as_absent() {
        let mw = RequestId::new().with_generator(|| "generated".to_owned());
        let service = Service::new(Router::new().get("/", show_id))
            .with(ContextInit)
            .with(mw);
        let res = service
            .handle(http::Request::get("/").header("x-request-id", "").body(String::new()).unwrap())
            .await;
        assert_eq!(res.headers()[HEADER], "generated");
    }

    #[tokio::test]
    async fn custom_header_and_key() {
        let mw = RequestId::new().header("x-correlation-id").context_key("cid");
        let reader = mw.clone();
        let handler = move |req: Request| {
            let id = reader.id_from(req.context()).unwrap_or_default();
            async move { id }
        };
        let service = Service::new(Router::new().get("/", handler))
            .with(ContextInit)
            .with(mw);
        let res = service
            .handle(
                http::Request::get("/")
                    .header("x-correlation-id", "abc")
                    .body(String::new())
                    .unwrap(),
            )
            .await;
        assert_eq!(res.headers()["x-correlation-id"], "abc");
        assert!(res.headers().get(HEADER).is_none());
        assert_eq!(res.body_text(), "abc");
    }

    #[test]
    fn set_header_uses_default_name() {
        let mut headers = HeaderMap::new();
        set_header(&mut headers, "abc");
        assert_eq!(headers["x-request-id"], "abc");
    }
}
