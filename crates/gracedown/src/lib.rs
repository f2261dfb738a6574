//! # Gracedown
//!
//! HTTP/1 server with graceful shutdown.
//!
//! This crate wraps hyper's connection serving with the bookkeeping needed to
//! stop a server without cutting off requests in progress:
//!
//! - [`ConnectionTracker`] - Lifecycle state of every open connection
//! - [`ListenerRegistry`] - Listeners currently being served, closable together
//! - [`Server`] - Accept loop and one-shot [`Server::close`]
//! - [`global`] - Process-wide default server and its `close`
//!
//! After [`Server::close`], listeners stop accepting, responses carry
//! `Connection: close`, and idle keep-alive connections are force-closed once
//! the grace period elapses. Every `serve` call returns after all connections
//! have finished.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gracedown::{handler::empty_handler, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .addr("0.0.0.0:8080")
//!         .handler(empty_handler())
//!         .build();
//!
//!     let closer = server.clone();
//!     tokio::spawn(async move { closer.close_on_signal().await });
//!
//!     server.listen_and_serve().await?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/gracedown/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
mod conn;
pub mod error;
pub mod global;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod tracker;

pub use config::{ServerConfig, ServerConfigBuilder, DEFAULT_ADDR, DEFAULT_GRACE_PERIOD_SECS};
pub use error::{ConfigError, ServerError};
pub use handler::Handler;
pub use listener::{Accept, ClosableListener, ListenerHandle, ListenerId};
pub use registry::ListenerRegistry;
pub use server::{Server, ServerBuilder};
pub use shutdown::{wait_for_os_signal, ShutdownState};
pub use tracker::{ConnState, ConnStateHook, ConnectionHandle, ConnectionId, ConnectionTracker};
