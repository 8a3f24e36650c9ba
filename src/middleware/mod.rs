//! Middleware layer.
//!
//! Middleware intercepts requests and responses and is the right place for
//! cross-cutting concerns. A [`Service`](crate::Service) holds an ordered
//! list of middleware in front of its router; each link receives the request
//! together with a [`Next`] continuation and decides whether, and how, to
//! forward it:
//!
//! ```text
//! ContextInit → RequestId → Recovery → … → Router → handler
//! ```
//!
//! Built-in links:
//! - [`context::ContextInit`] installs the per-request [`Context`](crate::Context) bag
//! - [`request_id::RequestId`] reads or generates the correlation id
//! - [`recovery::Recovery`] turns handler panics into `500` responses
//!
//! Handler adapters (wrap one handler, not the whole chain):
//! - [`json::validate`] schema-checks and decodes JSON bodies
//! - [`error::catch_errors`] lets handlers return `Result`
//!
//! Any `Fn(Request, Next) -> impl Future<Output = Response>` is a middleware
//! too:
//!
//! ```rust
//! use svckit::{Request, Response, Router, Service};
//! use svckit::middleware::Next;
//!
//! async fn timing(req: Request, next: Next) -> Response {
//!     let started = std::time::Instant::now();
//!     let res = next.run(req).await;
//!     tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "served");
//!     res
//! }
//!
//! let service = Service::simple(Router::new()).with(timing);
//! ```

pub mod context;
pub mod error;
pub mod json;
pub mod recovery;
pub mod request_id;

use std::future::Future;
use std::sync::Arc;

pub use crate::handler::BoxFuture;

use crate::handler::ErasedHandler;
use crate::request::Request;
use crate::response::Response;

/// One link of the chain.
///
/// The returned future must be `'static`: clone whatever configuration the
/// link needs into it (configuration is usually behind an `Arc`).
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, req: Request, next: Next) -> BoxFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, req: Request, next: Next) -> BoxFuture {
        Box::pin((self)(req, next))
    }
}

/// The ordered middleware list plus the endpoint it leads to.
pub(crate) struct Chain {
    links: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn ErasedHandler + Send + Sync>,
}

impl Chain {
    pub(crate) fn new(
        links: Vec<Arc<dyn Middleware>>,
        endpoint: Arc<dyn ErasedHandler + Send + Sync>,
    ) -> Self {
        Self { links, endpoint }
    }

    pub(crate) fn run(self: &Arc<Self>, req: Request) -> BoxFuture {
        Next { chain: Arc::clone(self), index: 0 }.run(req)
    }
}

/// The rest of the chain after the current link.
///
/// Consumed by [`Next::run`]: a link forwards a request at most once.
pub struct Next {
    chain: Arc<Chain>,
    index: usize,
}

impl Next {
    /// Forwards `req` to the following link, or to the endpoint when this
    /// was the last one.
    pub fn run(self, req: Request) -> BoxFuture {
        match self.chain.links.get(self.index) {
            Some(link) => {
                let link = Arc::clone(link);
                let next = Next { chain: self.chain, index: self.index + 1 };
                link.call(req, next)
            }
            None => self.chain.endpoint.call(req),
        }
    }
}
