//! Incoming HTTP request type.

use std::collections::HashMap;

use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, Uri};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;

use crate::context::Context;
use crate::error::BoxError;

/// Type-erased request body. Read it with [`Request::bytes`].
pub(crate) type Body = UnsyncBoxBody<Bytes, BoxError>;

/// An incoming HTTP request as seen by middleware and handlers.
///
/// Besides the usual parts it carries the request-scoped [`Context`] bag and
/// typed [`extensions`](Request::extensions), and it is moved (never
/// borrowed) from one link of the chain to the next.
pub struct Request {
    parts: http::request::Parts,
    body: Option<Body>,
    params: HashMap<String, String>,
    context: Context,
}

impl Request {
    pub(crate) fn new(req: http::Request<Body>) -> Self {
        let (parts, body) = req.into_parts();
        Self { parts, body: Some(body), params: HashMap::new(), context: Context::detached() }
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.parts.headers }

    /// Case-insensitive header lookup. Values that are not visible ASCII
    /// read as `None`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name)?.to_str().ok()
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn context(&self) -> &Context { &self.context }
    pub fn context_mut(&mut self) -> &mut Context { &mut self.context }

    pub fn extensions(&self) -> &Extensions { &self.parts.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.parts.extensions }

    /// Reads the whole body.
    ///
    /// The body can be read once; later calls return an empty buffer.
    pub async fn bytes(&mut self) -> Result<Bytes, BoxError> {
        match self.body.take() {
            Some(body) => Ok(body.collect().await?.to_bytes()),
            None => Ok(Bytes::new()),
        }
    }
}

/// Builds a [`Request`] from any `http::Request`, e.g. in tests:
///
/// ```rust
/// let req = svckit::Request::from(
///     http::Request::post("/users").body(String::from(r#"{"name":"ada"}"#)).unwrap(),
/// );
/// assert_eq!(req.path(), "/users");
/// ```
impl<B> From<http::Request<B>> for Request
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn from(req: http::Request<B>) -> Self {
        Self::new(req.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync()))
    }
}
