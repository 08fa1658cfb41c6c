//! Core DNS resolution types and traits.
//!
//! This module defines the `Resolve` trait and supporting types used by the
//! system dialer and the lookup-only local transport.

use crate::base::neterror::NetError;
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`], dropping a trailing root dot.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        let host: Box<str> = host.into();
        match host.strip_suffix('.') {
            Some(stripped) if !stripped.is_empty() => Self {
                host: stripped.into(),
            },
            _ => Self { host },
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }

    /// The name parsed as an IP literal, if it is one.
    pub fn as_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Trait for DNS resolution. Implementations must be thread-safe.
///
/// Returned addresses carry port 0; callers set the service port.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Which address families a lookup should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStrategy {
    #[default]
    UseIp,
    UseIp4,
    UseIp6,
}

impl QueryStrategy {
    pub fn accepts(&self, ip: &IpAddr) -> bool {
        match self {
            QueryStrategy::UseIp => true,
            QueryStrategy::UseIp4 => ip.is_ipv4(),
            QueryStrategy::UseIp6 => ip.is_ipv6(),
        }
    }

    /// Keep the addresses this strategy accepts, preserving order and
    /// dropping duplicates.
    pub fn filter(&self, addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = Vec::new();
        for ip in addrs {
            if self.accepts(&ip) && !out.contains(&ip) {
                out.push(ip);
            }
        }
        out
    }
}

/// DNS resolver wrapper that supports hostname overrides.
///
/// Overrides are consulted before the inner resolver. Useful for pinning
/// bootstrap names of DoH/DoT servers and for tests without real DNS.
///
/// # Example
///
/// ```rust,ignore
/// use muxnet::dns::{DnsResolverWithOverrides, GaiResolver};
/// use std::collections::HashMap;
///
/// let mut overrides = HashMap::new();
/// overrides.insert("dns.google".into(), vec!["8.8.8.8:0".parse().unwrap()]);
///
/// let resolver = DnsResolverWithOverrides::new(Arc::new(GaiResolver::new()), overrides);
/// ```
pub struct DnsResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: Arc<HashMap<Cow<'static, str>, Vec<SocketAddr>>>,
}

impl DnsResolverWithOverrides {
    pub fn new(
        inner: Arc<dyn Resolve>,
        overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    ) -> Self {
        Self {
            inner,
            overrides: Arc::new(overrides),
        }
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.overrides.get(name.as_str()) {
            let addrs: Addrs = Box::new(addrs.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        self.inner.resolve(name)
    }
}

impl fmt::Debug for DnsResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolverWithOverrides")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_name_strips_root_dot() {
        assert_eq!(Name::new("example.com.").as_str(), "example.com");
        assert_eq!(Name::new(".").as_str(), ".");
    }

    #[test]
    fn test_name_as_ip() {
        assert_eq!(Name::new("127.0.0.1").as_ip(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(Name::new("example.com").as_ip(), None);
    }

    #[test]
    fn test_query_strategy_filter() {
        let v4 = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let all = [v4, v6, v4];

        assert_eq!(QueryStrategy::UseIp.filter(all), vec![v4, v6]);
        assert_eq!(QueryStrategy::UseIp4.filter(all), vec![v4]);
        assert_eq!(QueryStrategy::UseIp6.filter(all), vec![v6]);
    }

    struct MockResolver {
        response: Vec<SocketAddr>,
    }

    impl Resolve for MockResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            let addrs = self.response.clone();
            Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) })
        }
    }

    #[tokio::test]
    async fn test_override_resolver_hit_and_miss() {
        let mock = Arc::new(MockResolver {
            response: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 0)],
        });

        let mut overrides = HashMap::new();
        overrides.insert(
            Cow::Borrowed("override.local"),
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)],
        );
        let resolver = DnsResolverWithOverrides::new(mock, overrides);

        let hit: Vec<_> = resolver.resolve(Name::new("override.local")).await.unwrap().collect();
        assert_eq!(hit[0].ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let miss: Vec<_> = resolver.resolve(Name::new("other.test")).await.unwrap().collect();
        assert_eq!(miss[0].ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
