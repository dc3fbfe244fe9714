use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TransportError};

pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_HOSTNAME: &str = "localhost:7777";

/// Literal that always means the local loopback interface.
pub const LOOPBACK_TOKEN: &str = "localhost";

const SERVER_BIT: u8 = 0b01;
const CLIENT_BIT: u8 = 0b10;

/// Role of the local process. A host is server and client at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum HostType {
    Server = SERVER_BIT,
    Client = CLIENT_BIT,
    Host = SERVER_BIT | CLIENT_BIT,
}

impl HostType {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn is_server(self) -> bool {
        self.bits() & SERVER_BIT != 0
    }

    pub fn is_client(self) -> bool {
        self.bits() & CLIENT_BIT != 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            "host" => Ok(Self::Host),
            _ => Err(ConfigError::InvalidHostType(s.to_string())),
        }
    }
}

/// `host[:port]` pair as typed by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        let invalid = || ConfigError::InvalidHostname(input.to_string());

        if input.is_empty() {
            return Err(invalid());
        }

        // [v6]:port
        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        match input.rsplit_once(':') {
            // A bare v6 literal has more than one colon and no port.
            Some((host, _)) if host.contains(':') => Ok(Self {
                host: input.to_string(),
                port: DEFAULT_PORT,
            }),
            Some((host, port)) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: port.parse().map_err(|_| invalid())?,
            }),
            Some(_) => Err(invalid()),
            None => Ok(Self {
                host: input.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Address a server binds to. Empty, `*` and the loopback token have fixed
/// meanings; anything else must resolve.
pub fn bind_address(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
    match address.trim() {
        "" | "*" => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
        other => resolve(other, port),
    }
}

/// Resolves a remote address, preferring IPv4 results.
pub fn resolve(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let address = address.trim();
    if address.eq_ignore_ascii_case(LOOPBACK_TOKEN) {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Unresolved(address.to_string()))?
        .collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| TransportError::Unresolved(address.to_string()))
}
