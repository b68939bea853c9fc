//! Resolving and connecting outbound TCP streams.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::result;
use std::str::FromStr;
use std::time::Duration;

use crate::debug;
use crate::error::DialError;

/// Address family requested when dialing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6 (`"tcp"`).
    Tcp,
    /// IPv4 only (`"tcp4"`).
    Tcp4,
    /// IPv6 only (`"tcp6"`).
    Tcp6,
}

impl Network {
    /// Returns `true` if `addr` belongs to this network family.
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = io::Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown network {other:?}"),
            )),
        }
    }
}

/// Resolves `address` to every socket address of the `network` family, in
/// resolver order.
///
/// # Errors
///
/// Returns [DialError::AddressResolution] if `network` is not a TCP family,
/// the address cannot be resolved, or no resolved address is of the requested
/// family.
pub fn resolve(network: &str, address: &str) -> result::Result<Vec<SocketAddr>, DialError> {
    let resolution_error = |source| DialError::AddressResolution {
        network: network.to_string(),
        address: address.to_string(),
        source,
    };

    let family: Network = network.parse().map_err(resolution_error)?;

    let addrs: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(resolution_error)?
        .filter(|addr| family.matches(addr))
        .collect();

    if addrs.is_empty() {
        return Err(resolution_error(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no {family} addresses found"),
        )));
    }

    Ok(addrs)
}

/// Connects to the first of `addrs` that accepts, optionally bounding each
/// attempt by `timeout`.
///
/// # Errors
///
/// Returns [DialError::ConnectionEstablishment] with the last attempt's error
/// if every address fails, or if `addrs` is empty.
pub fn connect(
    addrs: &[SocketAddr],
    timeout: Option<Duration>,
) -> result::Result<TcpStream, DialError> {
    let mut last = None;

    for &addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };

        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!("connect to {addr} failed: {err}");
                last = Some((addr, err));
            }
        }
    }

    let (addr, source) = last.unwrap_or_else(|| {
        (
            SocketAddr::from(([0, 0, 0, 0], 0)),
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to"),
        )
    });

    Err(DialError::ConnectionEstablishment { addr, source })
}

/// Resolves `address` for `network` and connects to it.
///
/// # Errors
///
/// See [resolve] and [connect].
pub fn dial(
    network: &str,
    address: &str,
    timeout: Option<Duration>,
) -> result::Result<TcpStream, DialError> {
    let addrs = resolve(network, address)?;
    connect(&addrs, timeout)
}
