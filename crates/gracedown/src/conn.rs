//! Accept loop and per-connection HTTP/1 serving.
//!
//! The driver accepts connections from a [`ClosableListener`], serves each one
//! on its own task with hyper, and reports every state transition through a
//! [`ConnStateHook`]:
//!
//! - `New` right after accept, before the connection task is spawned
//! - `Active` when hyper hands a request to the service
//! - `Idle` when the last in-flight response body has been written
//! - `Closed` or `Hijacked` when the connection task ends, from a drop guard

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::{HeaderValue, CONNECTION};
use http::{Request, StatusCode};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::handler::Handler;
use crate::listener::{Accept, ClosableListener};
use crate::tracker::{ConnState, ConnStateHook, ConnectionHandle};

/// First delay after a transient accept error.
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the accept backoff.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Serves HTTP/1 connections accepted from a listener.
pub(crate) struct Http1Driver {
    handler: Handler,
    keep_alives: Arc<AtomicBool>,
    hook: ConnStateHook,
}

impl Http1Driver {
    pub(crate) fn new(handler: Handler, keep_alives: Arc<AtomicBool>, hook: ConnStateHook) -> Self {
        Self {
            handler,
            keep_alives,
            hook,
        }
    }

    /// Runs the accept loop and returns the error that ended it.
    ///
    /// The listener is dropped when this returns, so the socket stops
    /// accepting at the OS level before the caller waits for drain.
    pub(crate) async fn run<L: Accept>(&self, mut listener: ClosableListener<L>) -> ServerError {
        let mut backoff: Option<Duration> = None;

        loop {
            let (io, peer_addr) = match listener.accept().await {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(ServerError::Accept(e)) if is_transient(&e) => {
                    let delay = next_backoff(backoff);
                    warn!(error = %e, retry_in = ?delay, "accept error");
                    tokio::time::sleep(delay).await;
                    backoff = Some(delay);
                    continue;
                }
                Err(e) => return e,
            };

            let conn = ConnectionHandle::new(peer_addr);
            (self.hook)(&conn, ConnState::New);
            let guard = ConnGuard {
                conn,
                hook: Arc::clone(&self.hook),
            };

            tokio::spawn(serve_connection(
                io,
                guard,
                Arc::clone(&self.handler),
                Arc::clone(&self.keep_alives),
            ));
        }
    }
}

/// Reports the terminal state when the connection task ends, even if the
/// task panicked or was cancelled.
struct ConnGuard {
    conn: ConnectionHandle,
    hook: ConnStateHook,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let state = if self.conn.is_hijacked() {
            ConnState::Hijacked
        } else {
            ConnState::Closed
        };
        (self.hook)(&self.conn, state);
    }
}

/// Counts requests whose response has not been fully written yet, so that
/// `Idle` is reported only when nothing is in flight.
#[derive(Clone)]
struct InFlight {
    count: Arc<AtomicUsize>,
    conn: ConnectionHandle,
    hook: ConnStateHook,
}

impl InFlight {
    fn begin(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        (self.hook)(&self.conn, ConnState::Active);
        InFlightGuard {
            in_flight: self.clone(),
        }
    }
}

struct InFlightGuard {
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let in_flight = &self.in_flight;
        if in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            (in_flight.hook)(&in_flight.conn, ConnState::Idle);
        }
    }
}

/// Response body that marks the request finished once hyper drops it.
struct TrackedBody<B> {
    inner: B,
    _guard: InFlightGuard,
}

impl<B> Body for TrackedBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

async fn serve_connection<I>(io: I, guard: ConnGuard, handler: Handler, keep_alives: Arc<AtomicBool>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let conn = guard.conn.clone();
    let in_flight = InFlight {
        count: Arc::new(AtomicUsize::new(0)),
        conn: conn.clone(),
        hook: Arc::clone(&guard.hook),
    };

    let service_conn = conn.clone();
    let service = service_fn(move |mut req: Request<Incoming>| {
        let request_guard = in_flight.begin();
        req.extensions_mut().insert(service_conn.clone());
        let handler = Arc::clone(&handler);
        let keep_alives = Arc::clone(&keep_alives);

        async move {
            let mut response = handler(req).await;
            if !keep_alives.load(Ordering::SeqCst)
                && response.status() != StatusCode::SWITCHING_PROTOCOLS
            {
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
            }
            Ok::<_, Infallible>(response.map(|body| TrackedBody {
                inner: body,
                _guard: request_guard,
            }))
        }
    });

    let mut connection = Box::pin(
        http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades(),
    );

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = conn.close_requested() => {
            debug!(conn = %conn.id(), peer = %conn.peer_addr(), "closing connection");
            // Idle: hyper closes at once. Mid-response: the write finishes first.
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!(conn = %conn.id(), peer = %conn.peer_addr(), error = %e, "connection error");
    }

    // Release in-flight bodies before reporting the terminal state.
    drop(connection);
    drop(guard);
}

/// Accept errors that say nothing about the listener itself.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    // EMFILE / ENFILE: out of descriptors, usually temporary under load.
    matches!(e.raw_os_error(), Some(23 | 24))
}

fn next_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => MIN_ACCEPT_BACKOFF,
        Some(delay) => (delay * 2).min(MAX_ACCEPT_BACKOFF),
    }
}
