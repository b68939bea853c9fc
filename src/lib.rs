//! Thread-per-connection TCP server with cooperative, bounded-latency
//! shutdown.
//!
//! A [Server] runs an accept loop on the caller's thread and hands every
//! accepted connection to a [Delegate] on a thread of its own. Each accept
//! is bounded by [ServerConfig::accept_timeout], so [Server::stop] returns
//! within roughly that long. The same server can dial outbound connections
//! that share its [ShutdownCoordinator].
//!
//! ```no_run
//! use std::io::{self, Read, Write};
//! use std::sync::Arc;
//! use std::thread;
//!
//! use tcp_server::{Conn, Delegate, Server, ServerConfig, TcpListener};
//!
//! struct Echo;
//!
//! impl Delegate for Echo {
//!     fn on_serve(&self, conn: &mut Conn<Self>) -> io::Result<()> {
//!         let mut buf = [0u8; 1024];
//!         loop {
//!             let nbytes = conn.read(&mut buf)?;
//!             if nbytes == 0 {
//!                 return Ok(());
//!             }
//!             conn.write_all(&buf[..nbytes])?;
//!         }
//!     }
//! }
//!
//! fn main() -> tcp_server::Result<()> {
//!     let server = Arc::new(Server::new(Arc::new(ServerConfig::default()), Arc::new(Echo))?);
//!     let listener = TcpListener::bind("127.0.0.1:7878")?;
//!
//!     let accept = {
//!         let server = Arc::clone(&server);
//!         thread::spawn(move || server.start(listener))
//!     };
//!
//!     // ...
//!
//!     server.stop();
//!     accept.join().expect("accept loop panicked")
//! }
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(unix))]
compile_error!("This crate relies on poll(2) and is only compatible with Unix systems.");

pub mod config;
pub mod conn;
pub mod error;
pub mod log;
pub mod net;
pub mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use conn::{Conn, Delegate};
pub use error::{AcceptError, DialError, Error, ErrorKind, LifecycleError, Result};
pub use net::{Listener, Network, TcpListener};
pub use server::{Server, ServerState};
pub use shutdown::ShutdownCoordinator;
