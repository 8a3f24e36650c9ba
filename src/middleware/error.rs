//! Handlers that return errors.
//!
//! [`catch_errors`] lets an endpoint return `Result<impl IntoResponse,
//! BoxError>` and turns the error side into a plain-text reply. Use it on the
//! endpoints that can fail; everything else keeps returning responses
//! directly.
//!
//! ```rust
//! use svckit::{BoxError, Request, Router, StatusError};
//! use svckit::middleware::error::catch_errors;
//! use http::StatusCode;
//!
//! async fn lookup(req: Request) -> Result<String, BoxError> {
//!     let id: u64 = req.param("id").unwrap_or_default().parse()?;   // → 500
//!     if id == 0 {
//!         return Err(StatusError::new(StatusCode::NOT_FOUND, "no such user").into());
//!     }
//!     Ok(format!("user {id}"))
//! }
//!
//! let router = Router::new().get("/users/{id}", catch_errors(lookup));
//! ```

use std::future::Future;

use http::StatusCode;

use crate::error::{BoxError, StatusError};
use crate::handler::Handler;
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// Adapts a fallible handler into a [`Handler`].
///
/// `Ok` values become the response as usual. An `Err` is answered with its
/// message plus a newline as `text/plain`; the status comes from a
/// [`StatusError`] and is `500` for any other error.
pub fn catch_errors<F, Fut, R>(handler: F) -> impl Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    move |req: Request| {
        let fut = handler(req);
        async move {
            match fut.await {
                Ok(res) => res.into_response(),
                Err(err) => error_response(err.as_ref()),
            }
        }
    }
}

fn error_response(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Response {
    let status = err
        .downcast_ref::<StatusError>()
        .map_or(StatusCode::INTERNAL_SERVER_ERROR, StatusError::status);
    Response::error(status, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Router, Service};

    fn service(handler: impl Handler) -> Service {
        Service::new(Router::new().post("/", handler))
    }

    fn post() -> http::Request<String> {
        http::Request::post("/").body(String::new()).unwrap()
    }

    #[tokio::test]
    async fn status_error_sets_status_and_body() {
        let svc = service(catch_errors(|_req: Request| async {
            Err::<(), BoxError>(StatusError::new(StatusCode::INTERNAL_SERVER_ERROR, "custom error").into())
        }));
        let res = svc.handle(post()).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body_text(), "custom error\n");
    }

    #[tokio::test]
    async fn declared_status_is_kept() {
        let svc = service(catch_errors(|_req: Request| async {
            Err::<(), BoxError>(StatusError::new(StatusCode::SERVICE_UNAVAILABLE, "Error").into())
        }));
        let res = svc.handle(post()).await;
        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.body_text(), "Error\n");
    }

    #[tokio::test]
    async fn any_error_defaults_to_500() {
        let svc = service(catch_errors(|_req: Request| async {
            Err::<(), BoxError>("any error".into())
        }));
        let res = svc.handle(post()).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body_text(), "any error\n");
    }

    #[tokio::test]
    async fn ok_passes_the_response_through() {
        let svc = service(catch_errors(|_req: Request| async { Ok::<_, BoxError>(()) }));
        let res = svc.handle(post()).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
    }
}
