//! Installs the per-request [`Context`](crate::Context) bag.
//!
//! Put it first: every later link can then `set`/`get` on
//! [`Request::context_mut`](crate::Request::context_mut).

use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;

#[derive(Clone, Copy, Debug, Default)]
pub struct ContextInit;

impl ContextInit {
    pub fn new() -> Self {
        Self
    }
}

impl Middleware for ContextInit {
    fn call(&self, mut req: Request, next: Next) -> BoxFuture {
        req.context_mut().init();
        next.run(req)
    }
}
