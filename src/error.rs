//! Unified error types.

use std::fmt;
use std::time::Duration;

use http::StatusCode;

/// Boxed error returned by fallible handlers.
///
/// Anything implementing [`std::error::Error`] converts into it with `?`,
/// including [`StatusError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by svckit's fallible operations.
///
/// Application-level errors (400, 404, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// infrastructure failures: binding a port, loading a schema, an outbound
/// request that exhausted its retries, or a drain that ran out of time.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address `{0}`")]
    Address(String),

    #[error("schema `{location}`: {reason}")]
    Schema { location: String, reason: String },

    #[error("request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("form encoding: {0}")]
    Form(#[from] serde_urlencoded::ser::Error),

    #[error("response deadline of {0:?} exceeded")]
    ResponseTimeout(Duration),

    #[error("shutdown deadline of {0:?} exceeded")]
    ShutdownTimeout(Duration),
}

impl Error {
    pub(crate) fn schema(location: &str, reason: impl fmt::Display) -> Self {
        Self::Schema { location: location.to_owned(), reason: reason.to_string() }
    }
}

/// An error that carries the HTTP status it should be answered with.
///
/// Return it from a handler wrapped by
/// [`catch_errors`](crate::middleware::error::catch_errors):
///
/// ```rust
/// use svckit::{BoxError, Request, StatusError};
/// use http::StatusCode;
///
/// async fn reserve(_req: Request) -> Result<&'static str, BoxError> {
///     Err(StatusError::new(StatusCode::CONFLICT, "seat already taken").into())
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusError {
    status: StatusCode,
    message: String,
}

impl StatusError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StatusError {}
