use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use n0_error::e;

use crate::error::AddressError;

/// Longest domain name that fits the one-byte length prefix of a SOCKS address.
const MAX_DOMAIN_LENGTH: usize = 255;

/// Destination address handed to the tunnel.
///
/// Mirrors the SOCKS5 address forms: an IP socket address, or a domain name
/// plus port that the routing layer resolves itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum SocksAddr {
    /// IPv4 or IPv6 literal with port.
    #[display("{_0}")]
    Ip(SocketAddr),
    /// Domain name with port. The name is never an IP literal.
    #[display("{_0}:{_1}")]
    Domain(String, u16),
}

impl FromStr for SocksAddr {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl SocksAddr {
    /// Parses a `host:port` string.
    ///
    /// IPv6 hosts must be bracketed (`[::1]:443`). Malformed input is rejected
    /// here; whether a valid address is reachable is up to the tunnel.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if let Ok(addr) = SocketAddr::from_str(address) {
            return Ok(Self::Ip(addr));
        }
        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(e!(AddressError::MissingPort {
                address: address.to_string()
            }));
        };
        let port = u16::from_str(port).map_err(|_| {
            e!(AddressError::InvalidPort {
                address: address.to_string()
            })
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(e!(AddressError::EmptyHost {
                address: address.to_string()
            }));
        }
        if let Ok(ip) = IpAddr::from_str(host) {
            return Ok(Self::Ip(SocketAddr::new(ip, port)));
        }
        if host.contains(':') {
            // An unbracketed IPv6 literal, or garbage; the port is ambiguous.
            return Err(e!(AddressError::MissingPort {
                address: address.to_string()
            }));
        }
        if host.len() > MAX_DOMAIN_LENGTH {
            return Err(e!(AddressError::DomainTooLong {
                address: address.to_string()
            }));
        }
        Ok(Self::Domain(host.to_string(), port))
    }
}

/// Splits `host[:port]` into host and optional port.
///
/// Brackets around IPv6 literals are kept on the host.
pub(crate) fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if host.starts_with('[') {
        match host.rfind(']') {
            Some(end) => match host[end + 1..].strip_prefix(':') {
                Some(port) => (&host[..=end], Some(port)),
                None => (host, None),
            },
            None => (host, None),
        }
    } else if let Some((h, p)) = host.split_once(':')
        && !p.contains(':')
    {
        (h, Some(p))
    } else {
        (host, None)
    }
}

/// Appends `default_port` to `host` unless it already carries a port.
pub(crate) fn with_default_port(host: &str, default_port: u16) -> String {
    match split_host_port(host) {
        (_, Some(_)) => host.to_string(),
        (h, None) if h.contains(':') && !h.starts_with('[') => format!("[{h}]:{default_port}"),
        (h, None) => format!("{h}:{default_port}"),
    }
}
