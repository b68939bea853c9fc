//! Per-connection handles and the delegate contract they drive.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::ServerConfig;
use crate::error::AcceptError;
use crate::shutdown::ShutdownCoordinator;
use crate::{debug, warn};

/// Source of connection identifiers, unique for the lifetime of the process.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks that decide what happens on an established connection.
///
/// A delegate is shared by every connection of a server and must therefore
/// be [Send] + [Sync]. The framing and meaning of the bytes exchanged is
/// entirely up to [on_serve](Delegate::on_serve).
pub trait Delegate: Send + Sync + Sized + 'static {
    /// Called once before the connection is served. Returning `false` closes
    /// the connection without calling [on_serve](Delegate::on_serve).
    fn on_connect(&self, _conn: &Conn<Self>) -> bool {
        true
    }

    /// Runs the connection's message loop until the peer goes away, an error
    /// occurs, or the handler decides to stop.
    ///
    /// Long-running handlers should poll [Conn::is_shutting_down] to take part
    /// in server shutdown; the server itself never interrupts them.
    fn on_serve(&self, conn: &mut Conn<Self>) -> io::Result<()>;

    /// Called once after the connection has been served, whether or not
    /// [on_serve](Delegate::on_serve) succeeded.
    fn on_close(&self, _conn: &Conn<Self>) {}

    /// Called from the accept loop whenever the listener fails fatally.
    fn on_accept_error(&self, _err: &AcceptError) {}
}

/// A TCP connection bundled with the configuration, delegate and shutdown
/// coordinator it runs under.
///
/// Created by the accept loop for inbound connections and by
/// [crate::Server::dial] for outbound ones.
#[derive(Debug)]
pub struct Conn<D> {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    config: Arc<ServerConfig>,
    delegate: Arc<D>,
    shutdown: ShutdownCoordinator,
    _slot: Option<ConnGuard>,
}

impl<D: Delegate> Conn<D> {
    /// Wraps `stream`, applying the socket options found in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer or local address cannot be queried, or if
    /// a socket option cannot be set.
    pub fn new(
        stream: TcpStream,
        config: Arc<ServerConfig>,
        delegate: Arc<D>,
        shutdown: ShutdownCoordinator,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;

        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        if config.nodelay {
            stream.set_nodelay(true)?;
        }

        Ok(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            peer,
            local,
            config,
            delegate,
            shutdown,
            _slot: None,
        })
    }

    /// Ties the connection to a slot of a [ConnLimiter], released when the
    /// connection is dropped.
    pub(crate) fn with_slot(mut self, slot: ConnGuard) -> Self {
        self._slot = Some(slot);
        self
    }

    /// Drives the delegate callbacks to completion and closes the socket.
    pub fn run(mut self) {
        let delegate = Arc::clone(&self.delegate);

        if !delegate.on_connect(&self) {
            debug!("[{}] connection rejected by delegate", self);
            self.close();
            return;
        }

        debug!("[{}] serving connection", self);

        if let Err(err) = delegate.on_serve(&mut self) {
            warn!("[{}] connection ended with error: {err}", self);
        }

        delegate.on_close(&self);
        self.close();

        debug!("[{}] connection closed", self);
    }

    /// Runs the connection on a new thread named `conn-<id>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread could not be spawned; the connection is
    /// dropped (and its socket closed) in that case.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("conn-{}", self.id))
            .spawn(move || self.run())
    }

    fn close(&self) {
        // The peer may already have gone away.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl<D> Conn<D> {
    /// Returns the process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the socket address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the socket address of the local half of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Returns the configuration the connection was created with.
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Returns the delegate serving the connection.
    pub fn delegate(&self) -> &Arc<D> {
        &self.delegate
    }

    /// Returns the shutdown coordinator shared with the server.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Returns `true` once the owning server has been asked to stop.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_signaled()
    }

    /// Returns a reference to the underlying stream.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Returns a mutable reference to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl<D> std::fmt::Display for Conn<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{} {} -> {}", self.id, self.local, self.peer)
    }
}

impl<D> Read for Conn<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl<D> Write for Conn<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Bounds the number of concurrently running inbound connections.
#[derive(Debug, Clone)]
pub(crate) struct ConnLimiter {
    active: Arc<AtomicUsize>,
    max: Option<usize>,
}

impl ConnLimiter {
    pub(crate) fn new(max: Option<usize>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Claims a slot, or returns `None` if the limit has been reached.
    pub(crate) fn try_acquire(&self) -> Option<ConnGuard> {
        let claimed = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| match self.max {
                Some(max) if active >= max => None,
                _ => Some(active + 1),
            });

        claimed.ok().map(|_| ConnGuard {
            active: Arc::clone(&self.active),
        })
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A claimed [ConnLimiter] slot, released on drop.
#[derive(Debug)]
pub(crate) struct ConnGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
