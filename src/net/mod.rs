//! Provides the listening and dialing halves of TCP connection setup.

pub mod dial;
pub mod listener;

pub use dial::Network;
pub use listener::{Listener, TcpListener};
