//! Peer addressing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Address of a peer process: IP address plus port.
///
/// This is also the `host_port` value exchanged during the init handshake.
/// A process that does not listen advertises the ephemeral address
/// `0.0.0.0:0`.
///
/// # Examples
///
/// ```
/// use tributary_core::HostPort;
///
/// let addr = HostPort::parse("127.0.0.1:4040").expect("parse");
/// assert_eq!(addr.to_string(), "127.0.0.1:4040");
/// assert!(!addr.is_ephemeral());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl HostPort {
    /// The address advertised by processes that do not accept connections.
    pub const EPHEMERAL: HostPort = HostPort {
        ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 0,
    };

    /// Create a new address.
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Whether this is the unroutable ephemeral address.
    pub fn is_ephemeral(&self) -> bool {
        self.port == 0 && self.ip.is_unspecified()
    }

    /// Convert to a socket address for dialing.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Parse from `ip:port`, accepting `[v6]:port` bracket notation.
    ///
    /// # Errors
    ///
    /// Returns error if IP or port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, HostPortParseError> {
        if let Some(bracket_end) = s.rfind(']') {
            if !s.starts_with('[') {
                return Err(HostPortParseError::InvalidIp);
            }
            let ip_str = &s[1..bracket_end];
            let port_str = s
                .get(bracket_end + 2..)
                .ok_or(HostPortParseError::MissingPort)?;
            let ip: IpAddr = ip_str.parse().map_err(|_| HostPortParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| HostPortParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        } else {
            let (ip_str, port_str) = s
                .rsplit_once(':')
                .ok_or(HostPortParseError::MissingPort)?;
            let ip: IpAddr = ip_str.parse().map_err(|_| HostPortParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| HostPortParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        }
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl std::str::FromStr for HostPort {
    type Err = HostPortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a [`HostPort`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostPortParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
}
