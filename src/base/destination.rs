//! Destination identity.
//!
//! A [`Destination`] names the far end of an outbound flow: an address, a
//! port and a network kind. Its canonical string form is the key used by the
//! connection cache.

use crate::base::neterror::NetError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Port used by the echo service (RFC 862). UDP flows to it are ping flows.
pub const ECHO_PORT: u16 = 7;

/// Transport-level network kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// A destination host: either a literal IP or a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl Address {
    /// Parse a host string, accepting bracketed IPv6 literals.
    pub fn parse(host: &str) -> Self {
        let trimmed = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_ascii_lowercase()),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            Address::Domain(_) => None,
        }
    }

    pub fn family(&self) -> Option<IpFamily> {
        self.ip().as_ref().map(IpFamily::of)
    }

    /// Host form suitable for TLS server names and HTTP authorities.
    pub fn host(&self) -> String {
        match self {
            Address::Ip(ip) => ip.to_string(),
            Address::Domain(domain) => domain.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => f.write_str(domain),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

/// The far end of an outbound flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
    pub network: Network,
}

impl Destination {
    pub fn new(address: impl Into<Address>, port: u16, network: Network) -> Self {
        Self {
            address: address.into(),
            port,
            network,
        }
    }

    pub fn tcp(address: impl Into<Address>, port: u16) -> Self {
        Self::new(address, port, Network::Tcp)
    }

    pub fn udp(address: impl Into<Address>, port: u16) -> Self {
        Self::new(address, port, Network::Udp)
    }

    /// Canonical `network:host:port` key.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Key by address only. Echo replies identify their source by IP alone.
    pub fn address_key(&self) -> String {
        self.address.to_string()
    }

    /// Socket address when the destination is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// UDP flows to an IP literal on the echo port are carried as ICMP echo.
    pub fn is_echo_target(&self) -> bool {
        self.network == Network::Udp && self.address.ip().is_some() && self.port == ECHO_PORT
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::tcp(addr.ip(), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ip(IpAddr::V6(ip)) => write!(f, "{}:[{}]:{}", self.network, ip, self.port),
            address => write!(f, "{}:{}:{}", self.network, address, self.port),
        }
    }
}

impl FromStr for Destination {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, rest) = match s.split_once(':') {
            Some(("tcp", rest)) => (Network::Tcp, rest),
            Some(("udp", rest)) => (Network::Udp, rest),
            _ => (Network::Tcp, s),
        };

        let (host, port) = rest.rsplit_once(':').ok_or(NetError::AddressInvalid)?;
        let port = port.parse::<u16>().map_err(|_| NetError::AddressInvalid)?;
        if host.is_empty() {
            return Err(NetError::AddressInvalid);
        }

        Ok(Destination::new(Address::parse(host), port, network))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_display_v4() {
        let dest = Destination::udp(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 53);
        assert_eq!(dest.to_string(), "udp:1.2.3.4:53");
        assert_eq!(dest.address_key(), "1.2.3.4");
    }

    #[test]
    fn test_display_v6_bracketed() {
        let dest = Destination::tcp(IpAddr::V6(Ipv6Addr::LOCALHOST), 853);
        assert_eq!(dest.to_string(), "tcp:[::1]:853");
        assert_eq!(dest.address_key(), "::1");
    }

    #[test]
    fn test_parse_roundtrip() {
        for s in ["udp:8.8.8.8:53", "tcp:[2001:db8::1]:853", "tcp:dns.google:443"] {
            let dest: Destination = s.parse().unwrap();
            assert_eq!(dest.to_string(), s);
        }
    }

    #[test]
    fn test_parse_defaults_to_tcp() {
        let dest: Destination = "one.one.one.one:853".parse().unwrap();
        assert_eq!(dest.network, Network::Tcp);
        assert_eq!(dest.address, Address::Domain("one.one.one.one".into()));
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!("udp:1.1.1.1:dns".parse::<Destination>().is_err());
        assert!("udp:1.1.1.1".parse::<Destination>().is_err());
    }

    #[test]
    fn test_echo_target() {
        let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
        assert!(Destination::udp(ip, ECHO_PORT).is_echo_target());
        assert!(!Destination::tcp(ip, ECHO_PORT).is_echo_target());
        assert!(!Destination::udp(ip, 53).is_echo_target());
        assert!(!Destination::udp(Address::Domain("x.test".into()), ECHO_PORT).is_echo_target());
    }
}
