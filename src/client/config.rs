//! Client configuration

use std::time::Duration;

use crate::connection::{ConnectionDetails, ReactorConfig};
use crate::protocol::constants::*;

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address and credentials
    pub details: ConnectionDetails,

    /// Deadline for correlated requests made on the caller's behalf
    /// (handshake, subscribe, file operations)
    pub request_timeout: Duration,

    /// Upper bound on DNS resolution plus TCP connect
    pub connect_timeout: Duration,

    /// Reconnect delay added per consecutive failure
    pub backoff_step: Duration,

    /// Maximum reconnect delay
    pub backoff_ceiling: Duration,

    /// Subscription health log interval
    pub stats_interval: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl ClientConfig {
    /// Defaults for everything except the server details
    pub fn new(details: ConnectionDetails) -> Self {
        Self {
            details,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            backoff_step: DEFAULT_BACKOFF_STEP,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            stats_interval: DEFAULT_STATS_INTERVAL,
            tcp_nodelay: true, // Important for low latency
        }
    }

    /// Config for `host` on the default HTSP port
    pub fn with_host(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(ConnectionDetails::new(
            host,
            DEFAULT_PORT,
            username,
            password,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ))
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set reconnect backoff step and ceiling
    pub fn backoff(mut self, step: Duration, ceiling: Duration) -> Self {
        self.backoff_step = step;
        self.backoff_ceiling = ceiling.max(step);
        self
    }

    /// Set subscription stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Disable TCP_NODELAY
    pub fn disable_nodelay(mut self) -> Self {
        self.tcp_nodelay = false;
        self
    }

    pub(crate) fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            connect_timeout: self.connect_timeout,
            tcp_nodelay: self.tcp_nodelay,
        }
    }
}

impl Default for ClientConfig {
    /// Anonymous login to a server on this machine
    fn default() -> Self {
        Self::with_host("localhost", "", "")
    }
}
