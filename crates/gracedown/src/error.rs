//! Error types for serving and configuration.

use std::io;

use thiserror::Error;

/// Errors returned by [`Server::serve`](crate::Server::serve) and
/// [`Server::listen_and_serve`](crate::Server::listen_and_serve).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the configured address.
    #[error("Bind error: failed to bind to {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The configured address could not be resolved.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The accept loop failed with a non-transient error.
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),

    /// The listener was closed while the accept loop was running.
    #[error("Listener closed")]
    ListenerClosed,
}

impl ServerError {
    /// Returns `true` if this error reports a closed listener.
    #[must_use]
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, Self::ListenerClosed)
    }
}

/// Errors raised while loading a [`ServerConfig`](crate::ServerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file is not valid TOML for this schema.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was present but unusable.
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}
