//! The accept loop, its lifecycle, and the outbound dial path.

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::conn::{Conn, ConnLimiter, Delegate};
use crate::error::{AcceptError, LifecycleError};
use crate::net::{Listener, dial};
use crate::shutdown::{ShutdownCoordinator, WorkGuard};
use crate::{Result, debug, error, info, warn};

/// Longest single accept window. `Instant` cannot represent arbitrarily
/// distant deadlines, so larger accept timeouts are cut to this.
const MAX_ACCEPT_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Lifecycle of a [Server].
///
/// A server moves strictly forward through these states and never returns to
/// an earlier one:
///
/// ```text
/// Created --start--> Running --stop--> Stopping --loop exits--> Stopped
///    |                                                            ^
///    +-------------------------stop-------------------------------+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Built but not yet accepting.
    Created = 0,
    /// The accept loop is running.
    Running = 1,
    /// Shutdown was requested; the accept loop has not yet exited.
    Stopping = 2,
    /// The accept loop has exited and the listener is closed.
    Stopped = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Created,
            1 => ServerState::Running,
            2 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Created => write!(f, "Created"),
            ServerState::Running => write!(f, "Running"),
            ServerState::Stopping => write!(f, "Stopping"),
            ServerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Accepts TCP connections and runs each one on its own thread.
///
/// [start](Server::start) occupies the calling thread until
/// [stop](Server::stop) is called from another thread (typically through an
/// `Arc<Server<_>>`). `stop` waits for the accept loop to exit, which takes at
/// most about one `accept_timeout`, but does not wait for connections that
/// are already running. Those can watch [Conn::is_shutting_down] to wind down
/// on their own.
///
/// A server runs at most once: it cannot be started again after it has been
/// stopped.
pub struct Server<D> {
    config: Arc<ServerConfig>,
    delegate: Arc<D>,
    shutdown: ShutdownCoordinator,
    state: AtomicU8,
    limiter: ConnLimiter,
}

impl<D: Delegate> Server<D> {
    /// Creates a server in the [ServerState::Created] state.
    ///
    /// # Errors
    ///
    /// Returns [crate::Error::Config] if `config` is invalid.
    pub fn new(config: Arc<ServerConfig>, delegate: Arc<D>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            limiter: ConnLimiter::new(config.max_connections),
            config,
            delegate,
            shutdown: ShutdownCoordinator::new(),
            state: AtomicU8::new(ServerState::Created as u8),
        })
    }

    /// Runs the accept loop on the calling thread until shutdown is signaled,
    /// then closes `listener`.
    ///
    /// Every accepted connection is handed to a new thread running
    /// [Conn::run]. Accept timeouts and transient failures are retried
    /// silently. Fatal listener failures are logged, passed to
    /// [Delegate::on_accept_error], and retried no sooner than the end of the
    /// current accept window.
    ///
    /// # Errors
    ///
    /// Returns [LifecycleError::AlreadyStarted] if the accept loop is already
    /// running, or [LifecycleError::AlreadyStopped] if the server has been
    /// stopped. The listener is closed in both cases.
    pub fn start<L: Listener>(&self, listener: L) -> Result<()> {
        // Tracked before the transition so a concurrent `stop` that observes
        // `Running` always has something to wait for.
        let work = self.shutdown.track();

        if let Err(state) = self.transition(ServerState::Created, ServerState::Running) {
            drop(work);
            listener.close();

            return Err(match state {
                ServerState::Created | ServerState::Running => LifecycleError::AlreadyStarted,
                ServerState::Stopping | ServerState::Stopped => LifecycleError::AlreadyStopped,
            }
            .into());
        }

        let addr = listener
            .local_addr()
            .map_or_else(|err| format!("<unknown: {err}>"), |addr| addr.to_string());

        info!("start listening on {addr}");

        let mut exit = LoopExit {
            state: &self.state,
            addr,
            listener: Some(listener),
            _work: work,
        };
        if let Some(listener) = exit.listener.as_mut() {
            self.accept_loop(listener);
        }

        Ok(())
    }

    fn accept_loop<L: Listener>(&self, listener: &mut L) {
        let timeout = self.config.accept_timeout.min(MAX_ACCEPT_WINDOW);

        while !self.shutdown.is_signaled() {
            let now = Instant::now();
            let deadline = now.checked_add(timeout).unwrap_or(now);

            match listener.accept_deadline(deadline) {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(AcceptError::Timeout) => {}
                Err(err) => {
                    error!("failed to accept connection: {err}");
                    self.delegate.on_accept_error(&err);

                    // A broken listener tends to fail instantly; wait out the
                    // window instead of spinning.
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                }
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        // The accept may have raced with `stop`.
        if self.shutdown.is_signaled() {
            debug!("closing connection from {peer} accepted during shutdown");
            return;
        }

        let Some(slot) = self.limiter.try_acquire() else {
            warn!(
                "connection limit ({}) reached -- closing connection from {peer}",
                self.config.max_connections.unwrap_or_default()
            );
            return;
        };

        let conn = match Conn::new(
            stream,
            Arc::clone(&self.config),
            Arc::clone(&self.delegate),
            self.shutdown.clone(),
        ) {
            Ok(conn) => conn.with_slot(slot),
            Err(err) => {
                warn!("failed to set up connection from {peer}: {err}");
                return;
            }
        };

        debug!("[{conn}] accepted connection");

        if let Err(err) = conn.spawn() {
            error!("failed to spawn thread for connection from {peer}: {err}");
        }
    }

    /// Signals shutdown and blocks until the accept loop has exited.
    ///
    /// Safe to call any number of times and from any thread; every call
    /// returns once the loop is gone. Calling `stop` before
    /// [start](Server::start) moves the server straight to
    /// [ServerState::Stopped]. Running connections are not waited for.
    pub fn stop(&self) {
        self.request_stop();
        self.shutdown.await_drain();
    }

    /// Like [stop](Server::stop), but gives up waiting after `timeout`.
    ///
    /// Returns `true` if the accept loop exited in time. Shutdown stays
    /// signaled either way.
    pub fn stop_timeout(&self, timeout: Duration) -> bool {
        self.request_stop();
        self.shutdown.await_drain_timeout(timeout)
    }

    fn request_stop(&self) {
        if self.shutdown.signal() {
            info!("shutdown signaled");
        }

        if self
            .transition(ServerState::Running, ServerState::Stopping)
            .is_err()
        {
            let _ = self.transition(ServerState::Created, ServerState::Stopped);
        }
    }

    /// Opens an outbound connection sharing this server's shutdown
    /// coordinator.
    ///
    /// `network` is one of `"tcp"`, `"tcp4"` or `"tcp6"`. The configuration
    /// and delegate may differ from the server's own. The returned connection
    /// has not been started; call [Conn::run] or [Conn::spawn]. It is not
    /// tracked by [stop](Server::stop), and dialing works in every server
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [crate::DialError::AddressResolution] if the address cannot be
    /// resolved for `network`, [crate::DialError::ConnectionEstablishment] if
    /// no resolved address accepts the connection, and [crate::Error::Io] if
    /// the configured socket options cannot be applied.
    pub fn dial<E: Delegate>(
        &self,
        network: &str,
        address: &str,
        config: Arc<ServerConfig>,
        delegate: Arc<E>,
    ) -> Result<Conn<E>> {
        let stream = dial::dial(network, address, config.dial_timeout)?;
        let conn = Conn::new(stream, config, delegate, self.shutdown.clone())?;

        debug!("[{conn}] dialed {network} {address}");

        Ok(conn)
    }
}

impl<D> Server<D> {
    /// Returns the current lifecycle state.
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the shutdown coordinator shared with every connection.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Returns the number of inbound connections whose threads are still
    /// running.
    pub fn active_connections(&self) -> usize {
        self.limiter.active()
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Returns the server delegate.
    pub fn delegate(&self) -> &Arc<D> {
        &self.delegate
    }

    fn transition(
        &self,
        from: ServerState,
        to: ServerState,
    ) -> std::result::Result<(), ServerState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ServerState::from_u8)
    }
}

/// Closes the listener and marks the server stopped once the accept loop is
/// left, whether it returned or unwound out of a delegate callback.
///
/// `_work` is declared last so the accept loop is untracked only after
/// `Stopped` has been stored.
struct LoopExit<'a, L: Listener> {
    state: &'a AtomicU8,
    addr: String,
    listener: Option<L>,
    _work: WorkGuard,
}

impl<L: Listener> Drop for LoopExit<'_, L> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("accept loop on {} panicked", self.addr);
        }
        info!("stop listening on {}", self.addr);

        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        self.state.store(ServerState::Stopped as u8, Ordering::Release);
    }
}

impl<D> fmt::Debug for Server<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("signaled", &self.shutdown.is_signaled())
            .field("active_connections", &self.active_connections())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::net::TcpListener;
    use std::io::{self, Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Condvar, Mutex};
    use std::thread::JoinHandle;

    /// Slack allowed on top of the accept timeout for thread scheduling.
    const SLACK: Duration = Duration::from_millis(450);

    const READ_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    #[derive(Debug, Default)]
    struct Recorder {
        hold: bool,
        connects: AtomicUsize,
        serving: AtomicUsize,
        accept_errors: AtomicUsize,
        released: Mutex<bool>,
        release: Condvar,
    }

    impl Recorder {
        fn echo() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn holding() -> Arc<Self> {
            Arc::new(Self {
                hold: true,
                ..Default::default()
            })
        }

        fn release(&self) {
            *self.released.lock().unwrap() = true;
            self.release.notify_all();
        }
    }

    impl Delegate for Recorder {
        fn on_connect(&self, _conn: &Conn<Self>) -> bool {
            self.connects.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_serve(&self, conn: &mut Conn<Self>) -> io::Result<()> {
            self.serving.fetch_add(1, Ordering::SeqCst);

            if self.hold {
                let mut released = self.released.lock().unwrap();
                while !*released {
                    released = self.release.wait(released).unwrap();
                }
                return Ok(());
            }

            let mut buf = [0u8; 64];
            loop {
                let nbytes = conn.read(&mut buf)?;
                if nbytes == 0 {
                    return Ok(());
                }
                conn.write_all(&buf[..nbytes])?;
            }
        }

        fn on_accept_error(&self, _err: &AcceptError) {
            self.accept_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(accept_timeout_ms: u64) -> Arc<ServerConfig> {
        let accept_timeout = Duration::from_millis(accept_timeout_ms);
        Arc::new(ServerConfig::default().with_accept_timeout(accept_timeout))
    }

    fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn serve<D: Delegate, L: Listener + 'static>(
        server: &Arc<Server<D>>,
        listener: L,
    ) -> JoinHandle<Result<()>> {
        let server = Arc::clone(server);
        let handle = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.start(listener))
        };

        assert!(eventually(Duration::from_secs(5), || {
            server.state() != ServerState::Created
        }));

        handle
    }

    fn loopback() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr();
        (listener, addr)
    }

    /// Signals shutdown from inside the accept call, as if `stop` raced a
    /// connection that was just arriving.
    struct RacingListener {
        shutdown: ShutdownCoordinator,
        pending: Option<TcpStream>,
    }

    impl Listener for RacingListener {
        fn accept_deadline(
            &mut self,
            _deadline: Instant,
        ) -> std::result::Result<(TcpStream, SocketAddr), AcceptError> {
            self.shutdown.signal();
            match self.pending.take() {
                Some(stream) => {
                    let peer = stream.peer_addr().map_err(AcceptError::Fatal)?;
                    Ok((stream, peer))
                }
                None => Err(AcceptError::Timeout),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    /// A listener whose every accept fails immediately.
    struct BrokenListener {
        attempts: Arc<AtomicUsize>,
    }

    impl Listener for BrokenListener {
        fn accept_deadline(
            &mut self,
            _deadline: Instant,
        ) -> std::result::Result<(TcpStream, SocketAddr), AcceptError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AcceptError::Fatal(io::Error::from_raw_os_error(libc::EMFILE)))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Err(io::Error::from_raw_os_error(libc::EBADF))
        }
    }

    /// Records the deadline of the single accept it serves, then signals
    /// shutdown.
    struct DeadlineListener {
        shutdown: ShutdownCoordinator,
        deadline: Arc<Mutex<Option<Instant>>>,
    }

    impl Listener for DeadlineListener {
        fn accept_deadline(
            &mut self,
            deadline: Instant,
        ) -> std::result::Result<(TcpStream, SocketAddr), AcceptError> {
            *self.deadline.lock().unwrap() = Some(deadline);
            self.shutdown.signal();
            Err(AcceptError::Timeout)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    /// A bound socket whose accepts always fail, so the failure reaches the
    /// delegate while the port is still held.
    struct FailingTcpListener {
        inner: TcpListener,
    }

    impl Listener for FailingTcpListener {
        fn accept_deadline(
            &mut self,
            _deadline: Instant,
        ) -> std::result::Result<(TcpStream, SocketAddr), AcceptError> {
            Err(AcceptError::Fatal(io::Error::from_raw_os_error(libc::ENFILE)))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.inner.local_addr())
        }
    }

    #[derive(Debug)]
    struct PanickingDelegate;

    impl Delegate for PanickingDelegate {
        fn on_serve(&self, _conn: &mut Conn<Self>) -> io::Result<()> {
            Ok(())
        }

        fn on_accept_error(&self, err: &AcceptError) {
            panic!("delegate failed handling {err}");
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = Arc::new(ServerConfig::default().with_accept_timeout(Duration::ZERO));
        let err = Server::new(config, Recorder::echo()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn stop_without_traffic_returns_within_accept_timeout() {
        let server = Arc::new(Server::new(config(50), Recorder::echo()).unwrap());
        let (listener, _) = loopback();
        let handle = serve(&server, listener);

        let start = Instant::now();
        server.stop();
        let elapsed = start.elapsed();

        assert!(elapsed <= Duration::from_millis(50) + SLACK, "stop took {elapsed:?}");
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.shutdown_coordinator().pending(), 0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn stop_twice_returns_both_times() {
        let server = Arc::new(Server::new(config(20), Recorder::echo()).unwrap());
        let (listener, _) = loopback();
        let handle = serve(&server, listener);

        server.stop();
        server.stop();
        assert!(server.stop_timeout(Duration::ZERO));

        assert_eq!(server.state(), ServerState::Stopped);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn concurrent_stops_all_return() {
        let server = Arc::new(Server::new(config(20), Recorder::echo()).unwrap());
        let (listener, _) = loopback();
        let handle = serve(&server, listener);

        let stoppers: Vec<_> = (0..4)
            .map(|_| {
                let server = Arc::clone(&server);
                thread::spawn(move || server.stop())
            })
            .collect();

        for stopper in stoppers {
            stopper.join().unwrap();
        }
        assert_eq!(server.state(), ServerState::Stopped);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn listener_is_closed_after_stop() {
        let server = Arc::new(Server::new(config(20), Recorder::echo()).unwrap());
        let (listener, addr) = loopback();
        let handle = serve(&server, listener);

        server.stop();

        assert!(TcpStream::connect(addr).is_err());
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn accepted_connections_are_served() {
        let delegate = Recorder::echo();
        let server = Arc::new(Server::new(config(20), Arc::clone(&delegate)).unwrap());
        let (listener, addr) = loopback();
        let handle = serve(&server, listener);

        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).unwrap();
            client.set_read_timeout(READ_TIMEOUT).unwrap();

            client.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
        }

        assert_eq!(delegate.connects.load(Ordering::SeqCst), 3);

        server.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn stop_does_not_wait_for_running_connections() {
        let delegate = Recorder::holding();
        let server = Arc::new(Server::new(config(50), Arc::clone(&delegate)).unwrap());
        let (listener, addr) = loopback();
        let handle = serve(&server, listener);

        let _client = TcpStream::connect(addr).unwrap();
        assert!(eventually(Duration::from_secs(5), || {
            delegate.serving.load(Ordering::SeqCst) == 1
        }));

        let start = Instant::now();
        server.stop();
        let elapsed = start.elapsed();

        assert!(elapsed <= Duration::from_millis(50) + SLACK, "stop took {elapsed:?}");
        assert_eq!(server.active_connections(), 1);
        handle.join().unwrap().unwrap();

        delegate.release();
        assert!(eventually(Duration::from_secs(5), || {
            server.active_connections() == 0
        }));
    }

    #[test]
    fn connection_accepted_during_shutdown_is_not_dispatched() {
        let delegate = Recorder::echo();
        let server = Server::new(config(20), Arc::clone(&delegate)).unwrap();

        let (mut std_listener, addr) = loopback();
        let mut client = TcpStream::connect(addr).unwrap();
        let (stream, _) = std_listener
            .accept_deadline(Instant::now() + Duration::from_secs(5))
            .unwrap();

        let listener = RacingListener {
            shutdown: server.shutdown_coordinator().clone(),
            pending: Some(stream),
        };

        server.start(listener).unwrap();

        assert_eq!(delegate.connects.load(Ordering::SeqCst), 0);
        assert_eq!(server.active_connections(), 0);
        assert_eq!(server.state(), ServerState::Stopped);

        client.set_read_timeout(READ_TIMEOUT).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn fatal_accept_errors_are_reported_without_spinning() {
        let delegate = Recorder::echo();
        let server = Arc::new(Server::new(config(20), Arc::clone(&delegate)).unwrap());
        let attempts = Arc::new(AtomicUsize::new(0));
        let handle = serve(
            &server,
            BrokenListener {
                attempts: Arc::clone(&attempts),
            },
        );

        thread::sleep(Duration::from_millis(150));
        server.stop();
        handle.join().unwrap().unwrap();

        let attempts = attempts.load(Ordering::SeqCst);
        let reported = delegate.accept_errors.load(Ordering::SeqCst);

        assert!(attempts >= 1);
        assert_eq!(reported, attempts);
        // Roughly one attempt per 20ms window over 150ms.
        assert!(attempts <= 20, "listener retried {attempts} times");
    }

    #[test]
    fn start_while_running_is_rejected() {
        let server = Arc::new(Server::new(config(20), Recorder::echo()).unwrap());
        let (listener, _) = loopback();
        let handle = serve(&server, listener);

        let (second, second_addr) = loopback();
        let err = server.start(second).unwrap_err();

        assert!(matches!(
            err,
            crate::Error::Lifecycle(LifecycleError::AlreadyStarted)
        ));
        assert!(TcpStream::connect(second_addr).is_err());

        server.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn restart_is_rejected_on_every_instance() {
        for _ in 0..3 {
            let server = Arc::new(Server::new(config(20), Recorder::echo()).unwrap());
            let (listener, _) = loopback();
            let handle = serve(&server, listener);

            server.stop();
            handle.join().unwrap().unwrap();

            let (listener, addr) = loopback();
            let err = server.start(listener).unwrap_err();

            assert_eq!(err.kind(), ErrorKind::Lifecycle);
            assert!(matches!(
                err,
                crate::Error::Lifecycle(LifecycleError::AlreadyStopped)
            ));
            assert_eq!(server.state(), ServerState::Stopped);
            assert!(TcpStream::connect(addr).is_err());
        }
    }

    #[test]
    fn stop_before_start_prevents_start() {
        let server = Server::new(config(20), Recorder::echo()).unwrap();

        let start = Instant::now();
        server.stop();
        assert!(start.elapsed() < SLACK);
        assert_eq!(server.state(), ServerState::Stopped);

        let (listener, _) = loopback();
        let err = server.start(listener).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Lifecycle(LifecycleError::AlreadyStopped)
        ));
    }

    #[test]
    fn connections_beyond_limit_are_closed() {
        let delegate = Recorder::holding();
        let config = Arc::new(
            ServerConfig::default()
                .with_accept_timeout(Duration::from_millis(20))
                .with_max_connections(1),
        );
        let server = Arc::new(Server::new(config, Arc::clone(&delegate)).unwrap());
        let (listener, addr) = loopback();
        let handle = serve(&server, listener);

        let _first = TcpStream::connect(addr).unwrap();
        assert!(eventually(Duration::from_secs(5), || {
            delegate.serving.load(Ordering::SeqCst) == 1
        }));

        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(READ_TIMEOUT).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));

        assert_eq!(delegate.connects.load(Ordering::SeqCst), 1);
        assert_eq!(server.active_connections(), 1);

        delegate.release();
        server.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn dial_unresolvable_address_fails_resolution() {
        let server = Server::new(config(20), Recorder::echo()).unwrap();

        let err = server
            .dial("tcp", "not-an-address", config(20), Recorder::echo())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressResolution);

        let err = server
            .dial("unix", "127.0.0.1:80", config(20), Recorder::echo())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressResolution);
    }

    #[test]
    fn dial_refused_address_fails_establishment() {
        let server = Server::new(config(20), Recorder::echo()).unwrap();
        let addr = {
            let (listener, addr) = loopback();
            drop(listener);
            addr
        };

        let err = server
            .dial("tcp4", &addr.to_string(), config(20), Recorder::echo())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionEstablishment);
    }

    #[test]
    fn dialed_connection_shares_shutdown_without_being_tracked() {
        let delegate = Recorder::echo();
        let server = Arc::new(Server::new(config(20), Arc::clone(&delegate)).unwrap());
        let (listener, addr) = loopback();
        let handle = serve(&server, listener);

        let mut conn = server
            .dial("tcp", &addr.to_string(), config(20), Recorder::echo())
            .unwrap();
        assert_eq!(conn.peer_addr(), addr);
        assert_eq!(server.shutdown_coordinator().pending(), 1);

        conn.write_all(b"hi").unwrap();
        conn.stream().set_read_timeout(READ_TIMEOUT).unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        assert!(!conn.is_shutting_down());
        server.stop();
        assert!(conn.is_shutting_down());
        assert_eq!(server.shutdown_coordinator().pending(), 0);

        handle.join().unwrap().unwrap();
    }

    #[test]
    fn unbounded_accept_timeout_uses_a_distant_deadline() {
        let config = Arc::new(ServerConfig::default().with_accept_timeout(Duration::MAX));
        let server = Server::new(config, Recorder::echo()).unwrap();
        let deadline = Arc::new(Mutex::new(None));
        let listener = DeadlineListener {
            shutdown: server.shutdown_coordinator().clone(),
            deadline: Arc::clone(&deadline),
        };

        let before = Instant::now();
        server.start(listener).unwrap();

        let deadline = deadline.lock().unwrap().unwrap();
        assert!(deadline > before + Duration::from_secs(60 * 60 * 24));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.shutdown_coordinator().pending(), 0);
    }

    #[test]
    fn stop_timeout_without_limit_waits_for_the_loop() {
        let idle = Server::new(config(20), Recorder::echo()).unwrap();
        assert!(idle.stop_timeout(Duration::MAX));
        assert_eq!(idle.state(), ServerState::Stopped);

        let server = Arc::new(Server::new(config(20), Recorder::echo()).unwrap());
        let (listener, _) = loopback();
        let handle = serve(&server, listener);

        assert!(server.stop_timeout(Duration::MAX));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.stop_timeout(Duration::MAX));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn connection_handles_cannot_release_the_accept_loop() {
        let server = Arc::new(Server::new(config(200), Recorder::echo()).unwrap());
        let (listener, addr) = loopback();
        let handle = serve(&server, listener);

        let conn = server
            .dial("tcp", &addr.to_string(), config(200), Recorder::echo())
            .unwrap();
        let coordinator = conn.shutdown_coordinator();

        assert!(!coordinator.await_drain_timeout(Duration::ZERO));
        assert!(coordinator.signal());

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(coordinator.pending(), 0);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn panicking_delegate_still_stops_the_server() {
        let server = Arc::new(Server::new(config(20), Arc::new(PanickingDelegate)).unwrap());
        let (inner, addr) = loopback();
        let handle = serve(&server, FailingTcpListener { inner });

        assert!(handle.join().is_err());

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.shutdown_coordinator().pending(), 0);
        assert!(TcpStream::connect(addr).is_err());

        let start = Instant::now();
        server.stop();
        assert!(start.elapsed() < SLACK);
    }
}
