//! Shutdown state and OS signal handling.
//!
//! A server moves through [`ShutdownState::Running`],
//! [`ShutdownState::Closing`] and [`ShutdownState::Closed`] exactly once and
//! never goes back.
//!
//! # Example
//!
//! ```rust,ignore
//! use gracedown::{handler::empty_handler, Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::default(), empty_handler());
//!
//! let closer = server.clone();
//! tokio::spawn(async move {
//!     // Completes on SIGTERM or SIGINT.
//!     closer.close_on_signal().await
//! });
//!
//! server.listen_and_serve().await?;
//! ```

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Shutdown progress of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Serving normally.
    Running,
    /// Shutdown requested, connections draining.
    Closing,
    /// Shutdown requested and every connection has reached a terminal state.
    Closed,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One-shot shutdown flag.
#[derive(Debug, Default)]
pub(crate) struct ShutdownFlag {
    state: AtomicU8,
}

impl ShutdownFlag {
    /// Moves `Running → Closing`. Returns `true` only for the winning caller.
    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Moves `Closing → Closed`. No-op in any other state.
    pub(crate) fn complete(&self) -> bool {
        self.state
            .compare_exchange(CLOSING, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    pub(crate) fn state(&self) -> ShutdownState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => ShutdownState::Running,
            CLOSING => ShutdownState::Closing,
            _ => ShutdownState::Closed,
        }
    }
}

/// Waits for an OS shutdown signal.
///
/// On Unix systems, this waits for SIGTERM or SIGINT.
/// On other systems, this only waits for Ctrl+C.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub async fn wait_for_os_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}
