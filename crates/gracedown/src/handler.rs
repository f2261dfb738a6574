//! Request handler type.
//!
//! The server does not route; every request on every connection goes to a
//! single [`Handler`]. The connection's [`ConnectionHandle`] is available in
//! the request extensions.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use gracedown::handler::{handler_fn, HttpResponse, ResponseBody};
//!
//! let handler = handler_fn(|_req| async {
//!     HttpResponse::new(ResponseBody::new(Bytes::from("hello")))
//! });
//! # let _ = handler;
//! ```
//!
//! [`ConnectionHandle`]: crate::tracker::ConnectionHandle

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;

/// Type alias for HTTP response body.
pub type ResponseBody = Full<Bytes>;

/// Type alias for the HTTP response.
pub type HttpResponse = Response<ResponseBody>;

/// Type alias for the boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HttpResponse> + Send>>;

/// A type-erased request handler.
pub type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

/// Wraps an async function or closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// A handler that answers every request with `200 OK` and an empty body.
pub fn empty_handler() -> Handler {
    handler_fn(|_req| async { HttpResponse::new(ResponseBody::new(Bytes::new())) })
}
