//! Gracefully stoppable HTTP server.
//!
//! # Architecture
//!
//! A [`Server`] owns:
//!
//! - a [`ConnectionTracker`] fed by every connection of every listener
//! - a [`ListenerRegistry`] of the listeners currently being served
//! - a one-shot shutdown flag and a keep-alive switch
//!
//! [`Server::close`] flips the flag, turns keep-alive off, closes every
//! registered listener and schedules the idle reaper. Each
//! [`Server::serve`] call sees its accept loop end, then waits for the
//! tracker to drain before returning.
//!
//! # Example
//!
//! ```rust,ignore
//! use gracedown::{handler::empty_handler, Server};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gracedown::ServerError> {
//!     let server = Server::builder()
//!         .addr("127.0.0.1:8080")
//!         .grace_period(Duration::from_secs(5))
//!         .handler(empty_handler())
//!         .build();
//!
//!     let closer = server.clone();
//!     tokio::spawn(async move { closer.close_on_signal().await });
//!
//!     server.listen_and_serve().await
//! }
//! ```

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Handle;

use crate::config::{ServerConfig, ServerConfigBuilder};
use crate::conn::Http1Driver;
use crate::error::ServerError;
use crate::handler::{empty_handler, Handler};
use crate::listener::{Accept, ClosableListener};
use crate::registry::ListenerRegistry;
use crate::shutdown::{wait_for_os_signal, ShutdownFlag, ShutdownState};
use crate::tracker::{ConnState, ConnStateHook, ConnectionHandle, ConnectionTracker};

/// How often idle connections are swept while a `serve` call drains after
/// its listener failed or was closed from outside.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// An HTTP/1 server with graceful shutdown.
///
/// Cloning is cheap; clones drive the same server, so one clone can
/// [`serve`](Self::serve) while another calls [`close`](Self::close).
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    handler: Handler,
    tracker: ConnectionTracker,
    registry: ListenerRegistry,
    shutdown: ShutdownFlag,
    keep_alives: Arc<AtomicBool>,
    /// Set once the grace period is over; late idlers are closed on sight.
    reaping: Arc<AtomicBool>,
    /// Tracker hook chained with the configured observer, built on first serve.
    hook: OnceLock<ConnStateHook>,
    /// Runtime of the first serve call, used by `close` for the grace timer.
    runtime: OnceLock<Handle>,
}

impl Server {
    /// Creates a server with the given configuration and handler.
    #[must_use]
    pub fn new(config: ServerConfig, handler: Handler) -> Self {
        let keep_alives = Arc::new(AtomicBool::new(config.keep_alives()));
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                tracker: ConnectionTracker::new(),
                registry: ListenerRegistry::new(),
                shutdown: ShutdownFlag::default(),
                keep_alives,
                reaping: Arc::new(AtomicBool::new(false)),
                hook: OnceLock::new(),
                runtime: OnceLock::new(),
            }),
        }
    }

    /// Creates a new server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Returns a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Returns the connection tracker.
    #[must_use]
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.inner.tracker
    }

    /// Returns the number of connections not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.tracker.open_connections()
    }

    /// Returns the number of idle keep-alive connections.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.inner.tracker.idle_connections()
    }

    /// Returns the number of listeners currently being served.
    #[must_use]
    pub fn active_listeners(&self) -> usize {
        self.inner.registry.len()
    }

    /// Returns the shutdown progress.
    #[must_use]
    pub fn shutdown_state(&self) -> ShutdownState {
        self.inner.shutdown.state()
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.shutdown.is_requested()
    }

    /// Returns `true` once shutdown has been requested and fully drained.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown_state() == ShutdownState::Closed
    }

    /// Binds the configured address and serves it.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidAddress`] if the address does not
    /// resolve, [`ServerError::Bind`] if binding fails, and otherwise whatever
    /// [`serve`](Self::serve) returns.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let addr = self.inner.config.addr();
        let target = bind_target(addr);
        let resolved = tokio::net::lookup_host(&*target)
            .await
            .map_err(|e| ServerError::InvalidAddress(format!("'{addr}': {e}")))?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress(format!("'{addr}' resolved to nothing")))?;

        let listener = TcpListener::bind(resolved)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        self.serve(listener).await
    }

    /// Serves connections from `listener` until it is closed.
    ///
    /// May run concurrently with other `serve` calls on distinct listeners.
    /// Does not return until every connection of this server has reached a
    /// terminal state, whatever ended the accept loop. Without a shutdown
    /// request, idle connections are closed once the grace period has passed
    /// so the wait stays bounded.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Accept`] for a non-transient accept failure.
    /// A closed listener is reported as [`ServerError::ListenerClosed`] unless
    /// it was closed by [`close`](Self::close), in which case `Ok(())` is
    /// returned.
    pub async fn serve<L: Accept>(&self, listener: L) -> Result<(), ServerError> {
        self.serve_listener(ClosableListener::new(listener)).await
    }

    /// Like [`serve`](Self::serve), for a listener whose
    /// [`ListenerHandle`](crate::listener::ListenerHandle) the caller keeps.
    ///
    /// # Errors
    ///
    /// See [`serve`](Self::serve).
    pub async fn serve_listener<L: Accept>(
        &self,
        listener: ClosableListener<L>,
    ) -> Result<(), ServerError> {
        let inner = &self.inner;
        let handle = listener.handle();
        let listener_id = handle.id();
        let local_addr = listener.local_addr().ok();

        let _ = inner.runtime.get_or_init(Handle::current);

        let result = if inner.registry.register(handle) {
            tracing::info!(listener = %listener_id, addr = ?local_addr, "Server listening");
            let driver = Http1Driver::new(
                Arc::clone(&inner.handler),
                Arc::clone(&inner.keep_alives),
                Arc::clone(self.hook()),
            );
            let err = driver.run(listener).await;
            inner.registry.unregister(listener_id);
            Err(err)
        } else {
            drop(listener);
            Err(ServerError::ListenerClosed)
        };

        if inner.shutdown.is_requested() {
            tracing::info!(
                listener = %listener_id,
                open = inner.tracker.open_connections(),
                "Waiting for connections to close"
            );
            inner.tracker.wait_drained().await;
        } else {
            if let Err(e) = &result {
                tracing::error!(listener = %listener_id, error = %e, "Server stopped");
            }
            self.drain_without_shutdown().await;
        }

        // Shutdown may have been requested while draining.
        if !inner.shutdown.is_requested() {
            return result;
        }
        if inner.shutdown.complete() {
            tracing::info!("All connections closed");
        }

        match result {
            Err(ServerError::ListenerClosed) => Ok(()),
            other => other,
        }
    }

    /// Waits for the gate after an accept loop ended on its own.
    ///
    /// Keep-alive stays on for the server's other listeners, so idle
    /// connections are swept once the grace period has passed and again on
    /// every [`IDLE_SWEEP_INTERVAL`] until everything has closed.
    async fn drain_without_shutdown(&self) {
        let tracker = &self.inner.tracker;
        let grace_period = self.inner.config.grace_period();
        tracing::info!(
            open = tracker.open_connections(),
            ?grace_period,
            "Listener gone, waiting for connections to close"
        );

        let sweeper = async {
            tokio::time::sleep(grace_period).await;
            loop {
                let reaped = tracker.close_idle();
                if reaped > 0 {
                    tracing::warn!(
                        reaped,
                        open = tracker.open_connections(),
                        "Closed idle connections"
                    );
                }
                tokio::time::sleep(IDLE_SWEEP_INTERVAL).await;
            }
        };

        tokio::select! {
            () = tracker.wait_drained() => {}
            _ = sweeper => {}
        }
    }

    /// Requests a graceful shutdown.
    ///
    /// Returns `true` for the first call on this server and `false` for every
    /// later one, which does nothing. The first call:
    ///
    /// 1. stops advertising keep-alive, so connections close after their
    ///    current response
    /// 2. closes every listener being served
    /// 3. force-closes idle connections once the grace period has elapsed,
    ///    or straight away if it is zero
    ///
    /// It does not wait for connections to drain; `serve` does.
    pub fn close(&self) -> bool {
        let inner = &self.inner;
        if !inner.shutdown.begin() {
            tracing::debug!("Shutdown already requested");
            return false;
        }

        let grace_period = inner.config.grace_period();
        tracing::info!(?grace_period, "Graceful shutdown requested");

        inner.keep_alives.store(false, Ordering::SeqCst);

        let listeners = inner.registry.close_all();
        tracing::debug!(listeners, "Listeners closed");

        if grace_period.is_zero() {
            reap_idle(&inner.tracker, &inner.reaping);
        } else if let Some(runtime) = Handle::try_current()
            .ok()
            .or_else(|| inner.runtime.get().cloned())
        {
            let tracker = inner.tracker.clone();
            let reaping = Arc::clone(&inner.reaping);
            runtime.spawn(async move {
                tokio::time::sleep(grace_period).await;
                reap_idle(&tracker, &reaping);
            });
        } else {
            // Nothing was ever served, so there is nothing to reap.
            tracing::debug!("No runtime available, skipping idle reaper");
        }

        true
    }

    /// Waits for SIGTERM or SIGINT (Ctrl+C off Unix), then calls
    /// [`close`](Self::close) and returns its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be registered.
    pub async fn close_on_signal(&self) -> io::Result<bool> {
        wait_for_os_signal().await?;
        Ok(self.close())
    }

    fn hook(&self) -> &ConnStateHook {
        self.inner.hook.get_or_init(|| {
            let tracker = self.inner.tracker.clone();
            let reaping = Arc::clone(&self.inner.reaping);
            let observer = self.inner.config.on_conn_state().cloned();
            Arc::new(move |conn: &ConnectionHandle, state: ConnState| {
                tracker.transition(conn, state);
                if state == ConnState::Idle && reaping.load(Ordering::SeqCst) && conn.close() {
                    tracing::debug!(
                        conn = %conn.id(),
                        peer = %conn.peer_addr(),
                        "Closed connection that went idle after the grace period"
                    );
                }
                if let Some(observer) = &observer {
                    observer(conn, state);
                }
            })
        })
    }
}

/// Expands a host-less `":port"` address to all interfaces.
fn bind_target(addr: &str) -> Cow<'_, str> {
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

fn reap_idle(tracker: &ConnectionTracker, reaping: &AtomicBool) {
    // Raised before the sweep so a connection going idle concurrently is
    // caught by one or the other.
    reaping.store(true, Ordering::SeqCst);
    let reaped = tracker.close_idle();
    if reaped > 0 {
        tracing::warn!(
            reaped,
            open = tracker.open_connections(),
            "Grace period over, closed idle connections"
        );
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("tracker", &self.inner.tracker)
            .field("registry", &self.inner.registry)
            .field("shutdown", &self.inner.shutdown.state())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and creating a [`Server`].
///
/// # Example
///
/// ```rust
/// use gracedown::Server;
/// use std::time::Duration;
///
/// let server = Server::builder()
///     .addr("127.0.0.1:9090")
///     .grace_period(Duration::from_secs(60))
///     .build();
///
/// assert_eq!(server.config().grace_period(), Duration::from_secs(60));
/// ```
#[derive(Default)]
pub struct ServerBuilder {
    config_builder: ServerConfigBuilder,
    handler: Option<Handler>,
}

impl ServerBuilder {
    /// Creates a new server builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request handler. Defaults to an empty `200 OK`.
    #[must_use]
    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets the bind address.
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.addr(addr);
        self
    }

    /// Sets the grace period for idle connections after shutdown.
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config_builder = self.config_builder.grace_period(grace_period);
        self
    }

    /// Enables or disables keep-alive while serving normally.
    #[must_use]
    pub fn keep_alives(mut self, enabled: bool) -> Self {
        self.config_builder = self.config_builder.keep_alives(enabled);
        self
    }

    /// Sets an observer chained after the server's connection bookkeeping.
    #[must_use]
    pub fn on_conn_state(mut self, hook: ConnStateHook) -> Self {
        self.config_builder = self.config_builder.on_conn_state(hook);
        self
    }

    /// Builds the server with the configured settings.
    #[must_use]
    pub fn build(self) -> Server {
        Server::new(
            self.config_builder.build(),
            self.handler.unwrap_or_else(empty_handler),
        )
    }
}
