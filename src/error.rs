//! Error types for accepting, dialing, and managing the server lifecycle.

use std::{error, fmt, io, net, result};

/// Creates an [io::Error] with a custom message prefixed to the current
/// `errno` value, preserving its [io::ErrorKind].
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        ::std::io::Error::new(errno.kind(), msg)
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur while running or dialing from a server.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred outside of accepting or dialing.
    Io(io::Error),
    /// An error occurred accepting a connection from a listener.
    Accept(AcceptError),
    /// An error occurred opening an outbound connection.
    Dial(DialError),
    /// The requested operation is not valid in the server's current state.
    Lifecycle(LifecycleError),
    /// The server configuration is invalid.
    Config(&'static str),
}

/// Coarse classification of every [Error].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An accept attempt reached its deadline or failed transiently.
    AcceptTimeout,
    /// The listener failed in a way that will not resolve by retrying.
    AcceptFatal,
    /// The dial address could not be resolved for the requested network.
    AddressResolution,
    /// The dial address resolved but no connection could be established.
    ConnectionEstablishment,
    /// Operation rejected by the server lifecycle.
    Lifecycle,
    /// Invalid configuration.
    Config,
    /// Any other I/O error.
    Io,
}

impl Error {
    /// Returns the [ErrorKind] of this error.
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::Io(_) => ErrorKind::Io,
            Error::Accept(AcceptError::Timeout) => ErrorKind::AcceptTimeout,
            Error::Accept(AcceptError::Fatal(_)) => ErrorKind::AcceptFatal,
            Error::Dial(DialError::AddressResolution { .. }) => ErrorKind::AddressResolution,
            Error::Dial(DialError::ConnectionEstablishment { .. }) => {
                ErrorKind::ConnectionEstablishment
            }
            Error::Lifecycle(_) => ErrorKind::Lifecycle,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            Error::Accept(ref err) => Some(err),
            Error::Dial(ref err) => Some(err),
            Error::Lifecycle(ref err) => Some(err),
            Error::Config(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<AcceptError> for Error {
    fn from(err: AcceptError) -> Error {
        Error::Accept(err)
    }
}

impl From<DialError> for Error {
    fn from(err: DialError) -> Error {
        Error::Dial(err)
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Error {
        Error::Lifecycle(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref e) => fmt::Display::fmt(e, f),
            Error::Accept(ref e) => fmt::Display::fmt(e, f),
            Error::Dial(ref e) => fmt::Display::fmt(e, f),
            Error::Lifecycle(ref e) => fmt::Display::fmt(e, f),
            Error::Config(msg) => write!(f, "invalid server configuration: {msg}"),
        }
    }
}

/// Outcome of a failed accept attempt.
#[derive(Debug)]
pub enum AcceptError {
    /// The deadline passed without a pending connection, or the attempt was
    /// interrupted by a transient condition (e.g., the peer aborted before
    /// the connection was accepted).
    Timeout,
    /// The listener itself failed (e.g., file descriptor exhaustion).
    Fatal(io::Error),
}

impl AcceptError {
    /// Returns `true` for errors that are expected to resolve on the next
    /// attempt.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AcceptError::Timeout)
    }
}

impl error::Error for AcceptError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            AcceptError::Timeout => None,
            AcceptError::Fatal(ref err) => Some(err),
        }
    }
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AcceptError::Timeout => write!(f, "accept timed out"),
            AcceptError::Fatal(ref err) => write!(f, "listener failed to accept: {err}"),
        }
    }
}

/// Error occurred while trying to open an outbound connection.
#[derive(Debug)]
#[non_exhaustive]
pub enum DialError {
    /// The address could not be resolved for the requested network.
    AddressResolution {
        /// Network family requested by the caller.
        network: String,
        /// Address string provided by the caller.
        address: String,
        /// Underlying resolver error.
        source: io::Error,
    },
    /// Every resolved address refused or failed the connection attempt.
    ConnectionEstablishment {
        /// The last address a connection was attempted to.
        addr: net::SocketAddr,
        /// Error returned by the last connection attempt.
        source: io::Error,
    },
}

impl error::Error for DialError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            DialError::AddressResolution { ref source, .. } => Some(source),
            DialError::ConnectionEstablishment { ref source, .. } => Some(source),
        }
    }
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DialError::AddressResolution {
                ref network,
                ref address,
                ref source,
            } => {
                write!(f, "failed to resolve {network} address {address:?}: {source}")
            }
            DialError::ConnectionEstablishment { addr, ref source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
        }
    }
}

/// Error occurred when a lifecycle transition is not permitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// `start` was called while the accept loop is already running.
    AlreadyStarted,
    /// `start` was called after the server was stopped. Servers cannot be
    /// restarted.
    AlreadyStopped,
}

impl error::Error for LifecycleError {}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LifecycleError::AlreadyStarted => write!(f, "server is already running"),
            LifecycleError::AlreadyStopped => {
                write!(f, "server has been stopped and cannot be restarted")
            }
        }
    }
}
