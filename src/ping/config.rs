use crate::base::destination::IpFamily;
use crate::base::neterror::NetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Which kind of ICMP socket the manager opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PingProtocol {
    /// Raw ICMP socket. Needs `CAP_NET_RAW` or root.
    #[default]
    Default,
    /// Datagram ICMP socket (`net.ipv4.ping_group_range` on Linux). The
    /// kernel owns the identifier field.
    Unprivileged,
}

impl PingProtocol {
    pub fn is_privileged(&self) -> bool {
        matches!(self, PingProtocol::Default)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PingProtocol::Default => "default",
            PingProtocol::Unprivileged => "unprivileged",
        }
    }
}

impl FromStr for PingProtocol {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(PingProtocol::Default),
            "unprivileged" => Ok(PingProtocol::Unprivileged),
            other => Err(NetError::UnknownPingProtocol(other.to_string())),
        }
    }
}

impl TryFrom<String> for PingProtocol {
    type Error = NetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PingProtocol> for String {
    fn from(protocol: PingProtocol) -> Self {
        protocol.as_str().to_string()
    }
}

impl fmt::Display for PingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Echo multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// IPv4 bind address; unspecified when absent.
    pub gateway4: Option<IpAddr>,
    /// IPv6 bind address; unspecified when absent.
    pub gateway6: Option<IpAddr>,
    pub disable_ipv6: bool,
    pub protocol: PingProtocol,
}

impl PingConfig {
    pub fn with_protocol(mut self, protocol: PingProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_gateway4(mut self, addr: Ipv4Addr) -> Self {
        self.gateway4 = Some(addr.into());
        self
    }

    pub fn with_gateway6(mut self, addr: Ipv6Addr) -> Self {
        self.gateway6 = Some(addr.into());
        self
    }

    pub fn with_ipv6_disabled(mut self, disabled: bool) -> Self {
        self.disable_ipv6 = disabled;
        self
    }

    /// Address the socket for `family` binds to.
    pub fn bind_addr(&self, family: IpFamily) -> IpAddr {
        match family {
            IpFamily::V4 => self.gateway4.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpFamily::V6 => self.gateway6.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        }
    }
}
