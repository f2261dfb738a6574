//! Connection lifecycle tracking.
//!
//! Every connection accepted by a [`Server`](crate::Server) reports its state
//! transitions to a [`ConnectionTracker`]. The tracker keeps the set of idle
//! keep-alive connections, so shutdown can reap them, and a wait gate counting
//! the connections that have not reached a terminal state yet.
//!
//! ```text
//!            ┌────────────┐
//!   accept ─▶│    New     │
//!            └─────┬──────┘
//!                  ▼
//!            ┌────────────┐  response written  ┌────────────┐
//!            │   Active   │───────────────────▶│    Idle    │
//!            │            │◀───────────────────│            │
//!            └─────┬──────┘    next request    └─────┬──────┘
//!                  ▼                                 ▼
//!            ┌──────────────────────────────────────────────┐
//!            │        Closed / Hijacked (terminal)           │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use gracedown::tracker::{ConnState, ConnectionHandle, ConnectionTracker};
//!
//! let tracker = ConnectionTracker::new();
//! let conn = ConnectionHandle::new("127.0.0.1:4000".parse().unwrap());
//!
//! tracker.transition(&conn, ConnState::New);
//! tracker.transition(&conn, ConnState::Active);
//! tracker.transition(&conn, ConnState::Idle);
//! assert_eq!(tracker.open_connections(), 1);
//! assert_eq!(tracker.idle_connections(), 1);
//!
//! tracker.transition(&conn, ConnState::Closed);
//! assert_eq!(tracker.open_connections(), 0);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Lifecycle state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepted, no request read yet.
    New,
    /// Processing a request.
    Active,
    /// Between requests, kept open for keep-alive reuse.
    Idle,
    /// Closed. Terminal.
    Closed,
    /// Taken over by a protocol upgrade. Terminal.
    Hijacked,
}

impl ConnState {
    /// Returns `true` for `Closed` and `Hijacked`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Hijacked)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Closed => "closed",
            Self::Hijacked => "hijacked",
        };
        f.write_str(name)
    }
}

/// Identifier of an accepted connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callback invoked for every connection state transition.
pub type ConnStateHook = Arc<dyn Fn(&ConnectionHandle, ConnState) + Send + Sync>;

/// A cloneable handle to an accepted connection.
///
/// The handle identifies the connection in state notifications and lets the
/// tracker force-close it. Request handlers can find it in the request
/// extensions.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    close_tx: watch::Sender<bool>,
    hijacked: AtomicBool,
}

impl ConnectionHandle {
    /// Creates a handle for a connection from `peer_addr`.
    #[must_use]
    pub fn new(peer_addr: SocketAddr) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::next(),
                peer_addr,
                close_tx,
                hijacked: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the remote address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Asks the connection task to drop the transport.
    ///
    /// Returns `true` if this call requested the close.
    pub fn close(&self) -> bool {
        !self.inner.close_tx.send_replace(true)
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        *self.inner.close_tx.borrow()
    }

    /// Resolves once a close has been requested.
    pub async fn close_requested(&self) {
        let mut rx = self.inner.close_tx.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Marks the connection as taken over by a protocol upgrade.
    ///
    /// When hyper hands the transport to the upgrade, the connection is
    /// reported as [`ConnState::Hijacked`] instead of [`ConnState::Closed`]
    /// and is no longer tracked.
    pub fn hijack(&self) {
        self.inner.hijacked.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if [`hijack`](Self::hijack) was called.
    #[must_use]
    pub fn is_hijacked(&self) -> bool {
        self.inner.hijacked.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("close_requested", &self.is_close_requested())
            .field("hijacked", &self.is_hijacked())
            .finish()
    }
}

/// Tracks every live connection of one server instance.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    /// Wait gate: number of connections not yet terminal.
    open_tx: watch::Sender<usize>,
}

#[derive(Default)]
struct TrackerState {
    conns: HashMap<ConnectionId, ConnState>,
    idle: HashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        let (open_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                open_tx,
            }),
        }
    }

    /// Records a state transition for `conn`.
    ///
    /// Transitions for connections the tracker does not know (never reported
    /// as `New`, or already terminal) are ignored, so the gate never goes
    /// negative.
    pub fn transition(&self, conn: &ConnectionHandle, new_state: ConnState) {
        let id = conn.id();
        let mut state = self.inner.state.lock();

        // Gauge deltas, so several servers in one process add up.
        let mut open_delta = 0_i8;
        let mut idle_delta = 0_i8;

        match new_state {
            ConnState::New => {
                if state.conns.insert(id, ConnState::New).is_none() {
                    open_delta = 1;
                }
                if state.idle.remove(&id).is_some() {
                    idle_delta = -1;
                }
            }
            ConnState::Active => {
                if state.idle.remove(&id).is_some() {
                    idle_delta = -1;
                }
                if let Some(current) = state.conns.get_mut(&id) {
                    *current = ConnState::Active;
                }
            }
            ConnState::Idle => {
                if let Some(current) = state.conns.get_mut(&id) {
                    *current = ConnState::Idle;
                    if state.idle.insert(id, conn.clone()).is_none() {
                        idle_delta = 1;
                    }
                }
            }
            ConnState::Closed | ConnState::Hijacked => {
                if state.idle.remove(&id).is_some() {
                    idle_delta = -1;
                }
                if state.conns.remove(&id).is_some() {
                    open_delta = -1;
                }
            }
        }

        let open = state.conns.len();
        let idle = state.idle.len();
        // Published under the lock so the gate never observes stale counts.
        self.inner.open_tx.send_replace(open);
        drop(state);

        tracing::trace!(conn = %id, peer = %conn.peer_addr(), state = %new_state, open, idle, "connection state");
        record_delta("gracedown_connections_open", open_delta);
        record_delta("gracedown_connections_idle", idle_delta);

        if open == 0 && new_state.is_terminal() {
            tracing::debug!("all connections closed");
        }
    }

    /// Returns the number of connections not yet in a terminal state.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        *self.inner.open_tx.borrow()
    }

    /// Returns the number of idle keep-alive connections.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Returns the current state of a tracked connection.
    #[must_use]
    pub fn state_of(&self, id: ConnectionId) -> Option<ConnState> {
        self.inner.state.lock().conns.get(&id).copied()
    }

    /// Force-closes every idle connection.
    ///
    /// Connections that are `New` or `Active` are left alone. Returns the
    /// number of connections signalled.
    pub fn close_idle(&self) -> usize {
        let state = self.inner.state.lock();
        let mut reaped = 0;
        for conn in state.idle.values() {
            if conn.close() {
                reaped += 1;
            }
        }
        drop(state);

        if reaped > 0 {
            metrics::counter!("gracedown_connections_reaped_total").increment(reaped as u64);
        }
        reaped
    }

    /// Waits until every tracked connection has reached a terminal state.
    ///
    /// Completes immediately if nothing is open.
    pub async fn wait_drained(&self) {
        let mut rx = self.inner.open_tx.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|open| *open == 0).await;
    }
}

fn record_delta(name: &'static str, delta: i8) {
    match delta {
        0 => {}
        d if d > 0 => metrics::gauge!(name).increment(f64::from(d)),
        d => metrics::gauge!(name).decrement(f64::from(-d)),
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionTracker")
            .field("open", &state.conns.len())
            .field("idle", &state.idle.len())
            .finish()
    }
}
