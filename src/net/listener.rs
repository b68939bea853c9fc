//! Listeners that can give up on an accept at a deadline.

use std::net::{self, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use std::{io, result};

use crate::error::{AcceptError, errno};

/// A bound, stream-oriented socket that a [crate::Server] accepts from.
///
/// Implementations must return from [accept_deadline](Listener::accept_deadline)
/// no later than (approximately) the given deadline, since that is what
/// bounds the latency of [crate::Server::stop].
pub trait Listener: Send {
    /// Waits for an inbound connection until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [AcceptError::Timeout] if the deadline passed or the attempt
    /// failed transiently, and [AcceptError::Fatal] if the listener itself is
    /// broken.
    fn accept_deadline(
        &mut self,
        deadline: Instant,
    ) -> result::Result<(TcpStream, SocketAddr), AcceptError>;

    /// Returns the local socket address of this listener.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Closes the listener, refusing any further connections.
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// A TCP socket server, listening for connections, whose accepts are bounded
/// by a deadline.
///
/// The underlying socket is kept in non-blocking mode and waited on with
/// `poll(2)`, so an accept never blocks past its deadline even if a pending
/// connection is reset between readiness and `accept(2)`.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
    addr: SocketAddr,
}

impl TcpListener {
    /// Creates a new `TcpListener` bound to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the socket cannot
    /// be switched to non-blocking mode.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::from_std(net::TcpListener::bind(addr)?)
    }

    /// Wraps an already bound standard library listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be switched to non-blocking mode
    /// or its local address cannot be queried.
    pub fn from_std(listener: net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        Ok(Self {
            inner: listener,
            addr,
        })
    }

    /// Returns the local socket address of this listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Unwraps the standard library listener (still in non-blocking mode).
    pub fn into_inner(self) -> net::TcpListener {
        self.inner
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Listener for TcpListener {
    fn accept_deadline(
        &mut self,
        deadline: Instant,
    ) -> result::Result<(TcpStream, SocketAddr), AcceptError> {
        let timeout = deadline.saturating_duration_since(Instant::now());

        if !poll_readable(self.inner.as_raw_fd(), timeout).map_err(classify)? {
            return Err(AcceptError::Timeout);
        }

        let (stream, peer) = self.inner.accept().map_err(classify)?;

        // BSD-derived systems let accepted sockets inherit `O_NONBLOCK`.
        stream.set_nonblocking(false).map_err(classify)?;

        Ok((stream, peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Sorts an I/O error raised while accepting into transient and fatal.
///
/// Besides timeouts and interruptions, `accept(2)` reports network errors
/// already pending on the new socket (see its Linux man page). These concern
/// one peer, not the listener, and are treated like a timeout.
pub(crate) fn classify(err: io::Error) -> AcceptError {
    match err.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => AcceptError::Timeout,
        _ => match err.raw_os_error() {
            Some(
                libc::EPROTO
                | libc::ENOPROTOOPT
                | libc::ENETDOWN
                | libc::ENETUNREACH
                | libc::EHOSTDOWN
                | libc::EHOSTUNREACH
                | libc::EOPNOTSUPP,
            ) => AcceptError::Timeout,
            _ => AcceptError::Fatal(err),
        },
    }
}

/// Converts `timeout` into a `poll(2)` timeout, rounding up to the next
/// millisecond so a sub-millisecond remainder does not become a busy poll.
fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Waits up to `timeout` for `fd` to become readable.
///
/// Returns `Ok(false)` if the timeout elapsed first.
fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let ready = unsafe { libc::poll(&raw mut pfd, 1, poll_timeout_ms(timeout)) };
    if ready == -1 {
        return Err(errno!("failed to poll listener"));
    }
    if ready == 0 {
        return Ok(false);
    }

    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if pfd.revents & libc::POLLERR != 0 {
        return Err(io::Error::other("listener socket reported an error condition"));
    }

    Ok(pfd.revents & libc::POLLIN != 0)
}
