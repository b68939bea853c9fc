//! An echo server that stops accepting when a line is read from `stdin`.
//!
//! Connections that are still open when the server stops keep echoing until
//! their next read times out, at which point they notice the shutdown and
//! close.
//!
//! To run the server:
//!
//!     cargo r --example echo
//!
//! And then in another terminal:
//!
//!     nc 127.0.0.1 6142

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tcp_server::log::{self, Level};
use tcp_server::{Conn, Delegate, Server, ServerConfig, TcpListener, info};

#[derive(Debug)]
struct Echo;

impl Delegate for Echo {
    fn on_connect(&self, conn: &Conn<Self>) -> bool {
        info!("[{conn}] accepted new connection");
        true
    }

    fn on_serve(&self, conn: &mut Conn<Self>) -> io::Result<()> {
        let mut buf = [0u8; 1024];

        while !conn.is_shutting_down() {
            let nbytes = match conn.read(&mut buf[..]) {
                Ok(0) => break,
                Ok(nbytes) => nbytes,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            };

            info!(
                "[{conn}] read {nbytes} bytes from peer: {}",
                String::from_utf8_lossy(&buf[..nbytes]).escape_debug()
            );

            conn.write_all(&buf[..nbytes])?;
        }

        Ok(())
    }

    fn on_close(&self, conn: &Conn<Self>) {
        info!("[{conn}] connection closed");
    }
}

fn main() -> tcp_server::Result<()> {
    log::set_max_level(Level::Debug);

    let config = ServerConfig::default()
        .with_accept_timeout(Duration::from_millis(250))
        .with_read_timeout(Duration::from_millis(500))
        .with_nodelay(true);

    let server = Arc::new(Server::new(Arc::new(config), Arc::new(Echo))?);
    let listener = TcpListener::bind("127.0.0.1:6142")?;

    let accept = {
        let server = Arc::clone(&server);
        thread::Builder::new()
            .name("accept".into())
            .spawn(move || server.start(listener))?
    };

    info!("press enter to stop the server");
    let _ = io::stdin().read_line(&mut String::new())?;

    server.stop();

    match accept.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("accept thread panicked").into()),
    }
}
