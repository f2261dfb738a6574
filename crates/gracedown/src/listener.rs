//! Closable listeners.
//!
//! Closing a tokio listener from another task is not possible while that
//! task is parked in `accept()`. [`ClosableListener`] pairs a listener with a
//! [`ListenerHandle`]; closing the handle makes a pending or future
//! [`accept`](ClosableListener::accept) fail with
//! [`ServerError::ListenerClosed`], after which the serve loop drops the
//! socket.
//!
//! Any transport can be served by implementing [`Accept`], for example a TLS
//! acceptor wrapping a [`TcpListener`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::ServerError;

/// An accept-capable socket.
pub trait Accept: Send + 'static {
    /// The connection type produced by `accept`.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Waits for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    /// Returns the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Identifier of a served listener, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A cloneable handle that closes a [`ClosableListener`].
#[derive(Clone)]
pub struct ListenerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ListenerId,
    closed_tx: watch::Sender<bool>,
}

impl ListenerHandle {
    fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id: ListenerId::next(),
                closed_tx,
            }),
        }
    }

    /// Returns the listener id.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    /// Closes the listener. Returns `true` if it was open.
    pub fn close(&self) -> bool {
        !self.inner.closed_tx.send_replace(true)
    }

    /// Returns `true` once the listener has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A listener that can be closed through its [`ListenerHandle`].
pub struct ClosableListener<L> {
    inner: L,
    handle: ListenerHandle,
}

impl<L: Accept> ClosableListener<L> {
    /// Wraps `inner`.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            handle: ListenerHandle::new(),
        }
    }

    /// Returns a handle that closes this listener.
    #[must_use]
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Returns the local address of the wrapped listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts the next connection, or fails once the listener is closed.
    pub async fn accept(&mut self) -> Result<(L::Io, SocketAddr), ServerError> {
        let mut closed = self.handle.subscribe();
        if *closed.borrow_and_update() {
            return Err(ServerError::ListenerClosed);
        }

        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(ServerError::ListenerClosed),
            result = self.inner.accept() => result.map_err(ServerError::Accept),
        }
    }
}

impl<L> fmt::Debug for ClosableListener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosableListener")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
