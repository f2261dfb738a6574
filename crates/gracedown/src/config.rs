//! Server configuration types.
//!
//! Configuration is built with a builder, and can be layered from a TOML file
//! and environment variables on top of the defaults.
//!
//! # Example
//!
//! ```rust
//! use gracedown::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .addr("127.0.0.1:8080")
//!     .grace_period(Duration::from_secs(30))
//!     .build();
//!
//! assert_eq!(config.addr(), "127.0.0.1:8080");
//! ```
//!
//! A file might look like:
//!
//! ```toml
//! addr = "0.0.0.0:8080"
//! grace_period_ms = 5000
//! keep_alives = true
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tracker::ConnStateHook;

/// Default bind address, the standard HTTP port on all interfaces.
pub const DEFAULT_ADDR: &str = "0.0.0.0:80";

/// Default grace period before idle connections are force-closed.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// Server configuration.
///
/// Use [`ServerConfig::builder()`] to construct instances.
#[derive(Clone)]
pub struct ServerConfig {
    /// Bind address for `listen_and_serve`
    addr: String,

    /// How long idle keep-alive connections survive a shutdown request
    grace_period: Duration,

    /// Whether responses allow keep-alive before shutdown
    keep_alives: bool,

    /// Observer chained after the server's own connection bookkeeping
    on_conn_state: Option<ConnStateHook>,
}

impl ServerConfig {
    /// Creates a new server configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Returns the bind address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns the grace period.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Returns whether keep-alive is enabled while serving normally.
    #[must_use]
    pub fn keep_alives(&self) -> bool {
        self.keep_alives
    }

    /// Returns the chained connection state observer, if any.
    #[must_use]
    pub fn on_conn_state(&self) -> Option<&ConnStateHook> {
        self.on_conn_state.as_ref()
    }

    /// Parses a TOML document over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(source)?;
        Ok(file.apply(Self::builder()).build())
    }

    /// Reads and parses a TOML file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if it is not valid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Applies `<PREFIX>_ADDR`, `<PREFIX>_GRACE_PERIOD_MS` and
    /// `<PREFIX>_KEEP_ALIVES` from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set but cannot be
    /// parsed.
    pub fn with_env_overrides(mut self, prefix: &str) -> Result<Self, ConfigError> {
        if let Some(addr) = env_var(prefix, "ADDR").filter(|addr| !addr.trim().is_empty()) {
            self.addr = addr;
        }

        if let Some(raw) = env_var(prefix, "GRACE_PERIOD_MS") {
            let millis = raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::invalid_value(format!("{prefix}_GRACE_PERIOD_MS"), e.to_string())
            })?;
            self.grace_period = Duration::from_millis(millis);
        }

        if let Some(raw) = env_var(prefix, "KEEP_ALIVES") {
            self.keep_alives = parse_bool(&raw).ok_or_else(|| {
                ConfigError::invalid_value(
                    format!("{prefix}_KEEP_ALIVES"),
                    format!("expected a boolean, got '{raw}'"),
                )
            })?;
        }

        Ok(self)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("grace_period", &self.grace_period)
            .field("keep_alives", &self.keep_alives)
            .field("on_conn_state", &self.on_conn_state.is_some())
            .finish()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Clone)]
pub struct ServerConfigBuilder {
    addr: String,
    grace_period: Duration,
    keep_alives: bool,
    on_conn_state: Option<ConnStateHook>,
}

impl ServerConfigBuilder {
    /// Creates a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            keep_alives: true,
            on_conn_state: None,
        }
    }

    /// Sets the bind address used by `listen_and_serve`.
    ///
    /// An empty address falls back to [`DEFAULT_ADDR`].
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        self.addr = if addr.trim().is_empty() {
            DEFAULT_ADDR.to_string()
        } else {
            addr
        };
        self
    }

    /// Sets the grace period.
    ///
    /// After shutdown is requested, idle keep-alive connections are given
    /// this long to go away before they are force-closed. Zero closes them
    /// immediately. Connections with a request in flight are never
    /// force-closed.
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Enables or disables keep-alive while serving normally.
    ///
    /// Keep-alive is always disabled once shutdown is requested.
    #[must_use]
    pub fn keep_alives(mut self, enabled: bool) -> Self {
        self.keep_alives = enabled;
        self
    }

    /// Sets an observer for connection state transitions.
    ///
    /// It runs after the server's own bookkeeping for every transition.
    #[must_use]
    pub fn on_conn_state(mut self, hook: ConnStateHook) -> Self {
        self.on_conn_state = Some(hook);
        self
    }

    /// Builds the [`ServerConfig`].
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            addr: self.addr,
            grace_period: self.grace_period,
            keep_alives: self.keep_alives,
            on_conn_state: self.on_conn_state,
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk configuration schema.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    addr: Option<String>,
    grace_period_ms: Option<u64>,
    keep_alives: Option<bool>,
}

impl FileConfig {
    fn apply(self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(addr) = self.addr {
            builder = builder.addr(addr);
        }
        if let Some(millis) = self.grace_period_ms {
            builder = builder.grace_period(Duration::from_millis(millis));
        }
        if let Some(enabled) = self.keep_alives {
            builder = builder.keep_alives(enabled);
        }
        builder
    }
}

fn env_var(prefix: &str, key: &str) -> Option<String> {
    std::env::var(format!("{prefix}_{key}")).ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
