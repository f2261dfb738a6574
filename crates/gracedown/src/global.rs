//! Process-wide default server.
//!
//! [`listen_and_serve`] and [`serve`] install a fresh [`Server`] with default
//! settings as the process default, replacing any previous one. [`close`]
//! shuts that server down.
//!
//! ```rust,ignore
//! use gracedown::{global, handler::empty_handler};
//!
//! tokio::spawn(async {
//!     tokio::signal::ctrl_c().await.ok();
//!     global::close();
//! });
//!
//! global::listen_and_serve(":8080", empty_handler()).await?;
//! ```

use parking_lot::RwLock;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::Handler;
use crate::listener::Accept;
use crate::server::Server;

static DEFAULT_SERVER: RwLock<Option<Server>> = parking_lot::const_rwlock(None);

fn install(server: &Server) {
    *DEFAULT_SERVER.write() = Some(server.clone());
}

/// Returns the current default server, if one was installed.
#[must_use]
pub fn default_server() -> Option<Server> {
    DEFAULT_SERVER.read().clone()
}

/// Creates a default server for `addr`, installs it, and serves.
///
/// # Errors
///
/// See [`Server::listen_and_serve`].
pub async fn listen_and_serve(addr: &str, handler: Handler) -> Result<(), ServerError> {
    let config = ServerConfig::builder().addr(addr).build();
    let server = Server::new(config, handler);
    install(&server);
    server.listen_and_serve().await
}

/// Creates a default server, installs it, and serves `listener`.
///
/// # Errors
///
/// See [`Server::serve`].
pub async fn serve<L: Accept>(listener: L, handler: Handler) -> Result<(), ServerError> {
    let server = Server::new(ServerConfig::default(), handler);
    install(&server);
    server.serve(listener).await
}

/// Closes the current default server.
///
/// Returns `false` if no default server exists or it was already closed.
pub fn close() -> bool {
    match default_server() {
        Some(server) => server.close(),
        None => {
            tracing::debug!("No default server to close");
            false
        }
    }
}
