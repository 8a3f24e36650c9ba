//! # svckit
//!
//! A small kit for HTTP services: a thin runner around hyper plus the
//! middleware every service ends up writing anyway.
//!
//! - **Request context**: a per-request key/value bag ([`Context`])
//! - **Request ids**: read from or generated into `x-request-id`, echoed back
//! - **Panic recovery**: handler panics become `500`, the server keeps going
//! - **JSON requests**: schema-validated, decoded bodies
//! - **Handler errors**: return `Result`, get a plain-text error reply
//! - **Tracing client**: outbound calls carry the request id, with retries
//! - **Graceful shutdown**: SIGTERM / Ctrl-C drain in-flight requests
//! - **Structured logs**: level-prefixed JSON tagged with the service name
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use svckit::{BoxError, Request, Router, Service, StatusError};
//! use svckit::logging::{self, LogConfig};
//! use svckit::middleware::{error::catch_errors, request_id};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BoxError> {
//!     logging::init(&LogConfig::from_env())?;
//!
//!     let app = Router::new()
//!         .get("/", index)
//!         .get("/err", catch_errors(fail));
//!
//!     Service::simple(app).listen_and_serve("0.0.0.0:8080").await?;
//!     Ok(())
//! }
//!
//! async fn index(mut req: Request) -> String {
//!     req.context_mut().set("key", "value");
//!     tracing::info!(context = ?req.context().snapshot(), "log context");
//!     let id = request_id::get(req.context()).unwrap_or_default();
//!     format!("({id}) Welcome to the home page!")
//! }
//!
//! async fn fail(_req: Request) -> Result<(), BoxError> {
//!     Err(StatusError::new(StatusCode::SERVICE_UNAVAILABLE, "Error").into())
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod client;
pub mod context;
pub mod env;
pub mod logging;
pub mod middleware;

pub use client::{RetryPolicy, TraceClient};
pub use context::{Context, Key};
pub use error::{BoxError, Error, StatusError};
pub use handler::Handler;
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::{Service, ServiceConfig, ShutdownHook};
