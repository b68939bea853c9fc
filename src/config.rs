//! Server and connection configuration.

use std::time::Duration;

use crate::{Error, Result};

/// Default time a single accept poll blocks before the shutdown flag is
/// re-checked.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration shared by a [crate::Server] and every connection it creates.
///
/// Only `accept_timeout` and `max_connections` are consulted by the accept
/// loop. The remaining options are applied to each [crate::Conn] when it is
/// built, and `dial_timeout` only affects [crate::Server::dial].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Maximum time the accept loop blocks per poll before checking whether
    /// shutdown was signaled. Bounds the latency of [crate::Server::stop].
    pub accept_timeout: Duration,
    /// Upper bound on concurrently running inbound connections. `None` spawns
    /// a thread for every accepted connection without limit.
    pub max_connections: Option<usize>,
    /// Timeout for establishing outbound connections. `None` blocks until the
    /// OS gives up.
    pub dial_timeout: Option<Duration>,
    /// Read timeout applied to each connection's socket.
    pub read_timeout: Option<Duration>,
    /// Write timeout applied to each connection's socket.
    pub write_timeout: Option<Duration>,
    /// Whether `TCP_NODELAY` is set on each connection's socket.
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            max_connections: None,
            dial_timeout: None,
            read_timeout: None,
            write_timeout: None,
            nodelay: false,
        }
    }
}

impl ServerConfig {
    /// Sets the accept poll timeout. Windows longer than a year are shortened
    /// to one year.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Bounds the number of concurrently running inbound connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Sets the outbound connect timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Sets the per-connection socket read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the per-connection socket write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Enables or disables `TCP_NODELAY` on each connection.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Checks that the configuration can be used by a server.
    ///
    /// # Errors
    ///
    /// Returns [Error::Config] if any timeout is zero (the OS treats a zero
    /// socket timeout as invalid, and a zero accept timeout would spin) or if
    /// `max_connections` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.accept_timeout.is_zero() {
            return Err(Error::Config("accept timeout must be non-zero"));
        }
        if self.max_connections == Some(0) {
            return Err(Error::Config("max connections must be non-zero"));
        }
        if self.dial_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config("dial timeout must be non-zero"));
        }
        if self.read_timeout.is_some_and(|t| t.is_zero())
            || self.write_timeout.is_some_and(|t| t.is_zero())
        {
            return Err(Error::Config("socket timeouts must be non-zero"));
        }

        Ok(())
    }
}
