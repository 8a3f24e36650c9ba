//! JSON requests validated against a JSON Schema.
//!
//! [`validate`] wraps one handler. Before the handler runs, the request must
//! declare `Content-Type: application/json`, its body must be valid JSON
//! that satisfies the schema, and it must deserialize into `T`. Any failure
//! is answered with `400 Bad Request` and a plain-text description; the
//! wrapped handler is not called. On success the decoded value is placed in
//! the request extensions, where [`get`] finds it.
//!
//! The schema is loaded and compiled once, at startup. A schema that cannot
//! be loaded or compiled is an [`Error`], so the service never starts with
//! a broken contract.
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use svckit::{Request, Router};
//! use svckit::middleware::json::{self, JsonSchema};
//!
//! #[derive(Clone, Deserialize)]
//! struct Order { sku: String, quantity: u32 }
//!
//! async fn create(req: Request) -> String {
//!     let order = json::get::<Order>(&req).expect("decoded by json::validate");
//!     format!("{} x {}", order.quantity, order.sku)
//! }
//!
//! # async fn run() -> Result<(), svckit::Error> {
//! let schema = JsonSchema::load("file:///etc/orders/order.schema.json").await?;
//! let router = Router::new().post("/orders", json::validate::<Order, _>(schema, create));
//! # Ok(()) }
//! ```

use std::sync::Arc;

use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::Response;

/// A compiled JSON Schema.
pub struct JsonSchema {
    location: String,
    validator: jsonschema::Validator,
}

impl JsonSchema {
    /// Loads and compiles the schema at `location`: a filesystem path, a
    /// `file://` URI, or an `http://` / `https://` URL.
    pub async fn load(location: &str) -> Result<Self, Error> {
        let raw = if location.starts_with("http://") || location.starts_with("https://") {
            reqwest::get(location)
                .await?
                .error_for_status()?
                .bytes()
                .await?
                .to_vec()
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            tokio::fs::read(path)
                .await
                .map_err(|e| Error::schema(location, e))?
        };
        let schema: Value =
            serde_json::from_slice(&raw).map_err(|e| Error::schema(location, e))?;
        Self::compile(location, &schema)
    }

    /// Compiles an in-memory schema.
    pub fn from_value(schema: &Value) -> Result<Self, Error> {
        Self::compile("<inline>", schema)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn compile(location: &str, schema: &Value) -> Result<Self, Error> {
        let validator = jsonschema::validator_for(schema).map_err(|e| Error::schema(location, e))?;
        Ok(Self { location: location.to_owned(), validator })
    }

    /// Every violation description, one per line.
    fn violations(&self, instance: &Value) -> Option<String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        (!errors.is_empty()).then(|| errors.join("\n"))
    }
}

/// A request body decoded by [`validate`].
#[derive(Clone, Debug)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Wraps `handler` so it only sees requests whose body satisfies `schema`
/// and decodes into `T`.
pub fn validate<T, H>(schema: JsonSchema, handler: H) -> impl Handler
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    H: Handler,
{
    let schema = Arc::new(schema);
    let inner = handler.into_boxed_handler();
    move |req: Request| decode::<T>(Arc::clone(&schema), Arc::clone(&inner), req)
}

/// The value decoded by [`validate`], if the request went through it.
pub fn get<T: Send + Sync + 'static>(req: &Request) -> Option<&T> {
    req.extensions().get::<Json<T>>().map(|json| &json.0)
}

async fn decode<T>(schema: Arc<JsonSchema>, inner: BoxedHandler, mut req: Request) -> Response
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    let is_json = req
        .header("content-type")
        .is_some_and(|ct| ct.contains("application/json"));
    if !is_json {
        return reject("Content-Type is not application/json");
    }

    let body = match req.bytes().await {
        Ok(body) => body,
        Err(e) => return reject(&e.to_string()),
    };

    let instance: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return reject(&e.to_string()),
    };

    if let Some(violations) = schema.violations(&instance) {
        return reject(&violations);
    }

    let decoded: T = match serde_json::from_value(instance) {
        Ok(v) => v,
        Err(e) => return reject(&e.to_string()),
    };

    req.extensions_mut().insert(Json(decoded));
    inner.call(req).await
}

fn reject(reason: &str) -> Response {
    tracing::debug!(reason, "rejecting json request");
    Response::error(StatusCode::BAD_REQUEST, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use crate::{Router, Service};

    #[derive(Clone, Debug, Deserialize)]
    struct TypeOnly {
        #[serde(rename = "type")]
        kind: String,
    }

    fn schema() -> JsonSchema {
        JsonSchema::from_value(&json!({
            "type": "object",
            "properties": { "type": { "type": "string", "enum": ["JSON"] } },
            "required": ["type"]
        }))
        .unwrap()
    }

    fn service(called: Arc<AtomicBool>) -> Service {
        let handler = move |req: Request| {
            called.store(true, Ordering::SeqCst);
            let kind = get::<TypeOnly>(&req).map(|t| t.kind.clone()).unwrap_or_default();
            async move { kind }
        };
        Service::new(Router::new().post("/", validate::<TypeOnly, _>(schema(), handler)))
    }

    fn post(content_type: Option<&str>, body: &str) -> http::Request<String> {
        let mut builder = http::Request::post("/");
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        builder.body(body.to_owned()).unwrap()
    }

    #[tokio::test]
    async fn rejects_wrong_content_type() {
        let called = Arc::new(AtomicBool::new(false));
        let res = service(Arc::clone(&called)).handle(post(None, r#"{"type":"JSON"}"#)).await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body_text(), "Content-Type is not application/json\n");
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejects_empty_body() {
        let called = Arc::new(AtomicBool::new(false));
        let res = service(Arc::clone(&called))
            .handle(post(Some("application/json"), ""))
            .await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejects_schema_violation() {
        let called = Arc::new(AtomicBool::new(false));
        let res = service(Arc::clone(&called))
            .handle(post(Some("application/json"), r#"{"type":"J"}"#))
            .await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert!(!res.body_text().trim().is_empty());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn joins_multiple_violations_with_newlines() {
        let schema = JsonSchema::from_value(&json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "integer" }
            }
        }))
        .unwrap();
        let violations = schema.violations(&json!({ "a": "x", "b": "y" })).unwrap();
        assert_eq!(violations.lines().count(), 2);
    }

    #[derive(Clone, Debug, Deserialize)]
    struct Counted {
        #[allow(dead_code)]
        n: u32,
    }

    #[tokio::test]
    async fn rejects_body_that_does_not_decode_into_the_target() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handler = move |_req: Request| {
            flag.store(true, Ordering::SeqCst);
            async { "reached" }
        };
        let open = JsonSchema::from_value(&json!({ "type": "object" })).unwrap();
        let service = Service::new(Router::new().post("/", validate::<Counted, _>(open, handler)));

        let res = service.handle(post(Some("application/json"), r#"{"m":1}"#)).await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body_text(), "missing field `n`\n");
        assert!(!called.load(Ordering::SeqCst));
    }

    /// A body whose transport fails on the first read.
    struct BrokenBody;

    impl hyper::body::Body for BrokenBody {
        type Data = bytes::Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<hyper::body::Frame<Self::Data>, Self::Error>>> {
            std::task::Poll::Ready(Some(Err(std::io::Error::other("connection reset"))))
        }
    }

    #[tokio::test]
    async fn rejects_body_that_cannot_be_read() {
        let called = Arc::new(AtomicBool::new(false));
        let req = http::Request::post("/")
            .header("content-type", "application/json")
            .body(BrokenBody)
            .unwrap();
        let res = service(Arc::clone(&called)).handle(Request::from(req)).await;
        assert_eq!(res.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(res.body_text(), "connection reset\n");
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn passes_valid_body_to_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let res = service(Arc::clone(&called))
            .handle(post(Some("application/json; charset=utf-8"), r#"{"type":"JSON"}"#))
            .await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body_text(), "JSON");
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn loads_schema_from_file_uri() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"type":"object","required":["type"]}}"#).unwrap();
        let uri = format!("file://{}", file.path().display());

        let schema = JsonSchema::load(&uri).await.unwrap();
        assert_eq!(schema.location(), uri);
        assert!(schema.violations(&json!({})).is_some());
        assert!(schema.violations(&json!({ "type": "x" })).is_none());
    }

    #[tokio::test]
    async fn unloadable_schema_is_an_error() {
        let err = JsonSchema::load("/definitely/not/here.json").await.err().unwrap();
        assert!(matches!(err, Error::Schema { .. }));

        let err = JsonSchema::from_value(&json!({ "type": 12 })).err().unwrap();
        assert!(matches!(err, Error::Schema { .. }));
    }
}
